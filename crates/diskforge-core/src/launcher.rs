//! Launching one command inside a fresh PID namespace.
//!
//! The launched process is the namespace's init. It checks that it really is
//! PID 1, runs the requested command with its output in the diagnostic log,
//! and then clears the namespace: SIGTERM to everything left, a grace
//! period, SIGKILL to survivors. Without that escalation, orphans of the
//! command would linger until the host's init reaped them.
//!
//! The parent learns the child's namespace PID over a pipe and does not
//! return from [`Launcher::launch`] until the child has either confirmed
//! PID 1 or reported a mismatch.

use std::fs::File;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use diskforge_common::constants::{
    DEFAULT_GRACE_PERIOD, LAUNCH_REFUSED_EXIT_CODE, NAMESPACE_INIT_PID,
};
use diskforge_common::error::{DiskforgeError, Result};
use nix::fcntl::OFlag;

use crate::command::{CommandRunner, CommandSpec, OutputMode};
use crate::log_sink::LogSink;
use crate::namespace::{GroupSignal, Isolation};

/// A contained process that passed the namespace-PID check.
///
/// Consumed by [`crate::supervisor::Supervisor::supervise`].
#[derive(Debug)]
#[must_use = "a contained process must be supervised to be reaped"]
pub struct ContainedProcess {
    host_pid: i32,
    namespace_pid: i32,
    command: CommandSpec,
}

impl ContainedProcess {
    /// PID of the process as seen from the launching (host) namespace.
    pub const fn host_pid(&self) -> i32 {
        self.host_pid
    }

    /// PID of the process inside its own namespace. Always 1.
    pub const fn namespace_pid(&self) -> i32 {
        self.namespace_pid
    }

    /// The command the process is running.
    pub const fn command(&self) -> &CommandSpec {
        &self.command
    }
}

/// Starts commands as the init of a new PID namespace.
pub struct Launcher {
    isolation: Arc<dyn Isolation>,
    runner: Arc<dyn CommandRunner>,
    grace_period: Duration,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("grace_period", &self.grace_period)
            .finish_non_exhaustive()
    }
}

impl Launcher {
    /// Creates a launcher with the default grace period.
    pub fn new(isolation: Arc<dyn Isolation>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            isolation,
            runner,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Sets the wait between SIGTERM and SIGKILL.
    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Launches `command` as PID 1 of a new PID namespace.
    ///
    /// # Errors
    ///
    /// Returns `DiskforgeError::Launch` if the process cannot be created,
    /// exits before reporting its namespace PID, or reports a PID other
    /// than 1. In the latter two cases the child has already been reaped.
    pub fn launch(&self, command: &CommandSpec, log: &LogSink) -> Result<ContainedProcess> {
        let (mut report_rx, report_tx) = report_pipe()?;

        let host_pid = {
            let mut init = || self.contained_init(command, log, &report_tx);
            self.isolation.spawn_isolated(&mut init)?
        };
        drop(report_tx);
        tracing::info!(host_pid, %command, "launched contained process");

        let mut buf = [0u8; 4];
        let reported = report_rx.read_exact(&mut buf).map(|()| i32::from_ne_bytes(buf));
        match reported {
            Ok(NAMESPACE_INIT_PID) => Ok(ContainedProcess {
                host_pid,
                namespace_pid: NAMESPACE_INIT_PID,
                command: command.clone(),
            }),
            Ok(namespace_pid) => {
                let _ = self.isolation.wait(host_pid);
                Err(DiskforgeError::Launch {
                    message: format!(
                        "contained process {host_pid} saw itself as pid {namespace_pid}, expected {NAMESPACE_INIT_PID}"
                    ),
                })
            }
            Err(e) => {
                let _ = self.isolation.wait(host_pid);
                Err(DiskforgeError::Launch {
                    message: format!(
                        "contained process {host_pid} exited before reporting its pid: {e}"
                    ),
                })
            }
        }
    }

    /// Body of the contained init. The return value is its exit status.
    fn contained_init(&self, command: &CommandSpec, log: &LogSink, report: &File) -> i32 {
        let pid = self.isolation.namespace_pid();
        let _ = (&*report).write_all(&pid.to_ne_bytes());
        if pid != NAMESPACE_INIT_PID {
            log.record(format!("CONTAINER FAILED: pid {pid} != {NAMESPACE_INIT_PID}"));
            return LAUNCH_REFUSED_EXIT_CODE;
        }

        log.record(format!("CONTAINED COMMAND: \"{command}\""));
        let exit_code = match self.runner.run(command, log, OutputMode::Logged) {
            Ok(_) => 0,
            Err(e) => {
                log.record(format!("ERROR exit code from contained command: {e}"));
                1
            }
        };
        self.clear_namespace(pid, log);
        exit_code
    }

    /// Terminates every process left in the namespace.
    fn clear_namespace(&self, pid: i32, log: &LogSink) {
        log.record(format!("{pid} SIGTERM"));
        if !self.isolation.signal_all(GroupSignal::Terminate) {
            return;
        }
        self.isolation.sleep(self.grace_period);

        log.record(format!("{pid} sending SIGKILL..."));
        if self.isolation.signal_all(GroupSignal::Kill) {
            log.record("some processes remained to SIGKILL");
        } else {
            log.record("all processes properly terminated");
        }
    }
}

/// Pipe the contained init reports its namespace PID over. Both ends are
/// close-on-exec so the contained command and its descendants never hold
/// them.
fn report_pipe() -> Result<(File, File)> {
    let (rx, tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| DiskforgeError::Launch {
        message: format!("pipe failed: {e}"),
    })?;
    Ok((File::from(rx), File::from(tx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, FakeIsolation, IsolationEvent};

    fn fixture(isolation: FakeIsolation) -> (tempfile::TempDir, LogSink, Arc<FakeIsolation>, Arc<FakeHost>, Launcher) {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = LogSink::open(dir.path().join("launch.log")).expect("log");
        let isolation = Arc::new(isolation);
        let host = Arc::new(FakeHost::new());
        let launcher = Launcher::new(isolation.clone(), host.clone())
            .with_grace_period(Duration::from_secs(2));
        (dir, log, isolation, host, launcher)
    }

    fn tag_script() -> CommandSpec {
        CommandSpec::new("chroot").args(["/mnt/root", "sh", "/tmp/tag-script"])
    }

    #[test]
    fn wrong_namespace_pid_never_runs_command() {
        let (_dir, log, isolation, host, launcher) = fixture(FakeIsolation::with_namespace_pid(7));

        let err = launcher.launch(&tag_script(), &log).unwrap_err();

        assert!(matches!(err, DiskforgeError::Launch { .. }));
        assert!(host.commands().is_empty());
        assert!(log.tail(5).iter().any(|l| l.ends_with("CONTAINER FAILED: pid 7 != 1")));
        assert!(isolation.signals().is_empty());
        assert_eq!(isolation.waited(), vec![isolation.last_pid()]);
    }

    #[test]
    fn wrong_namespace_pid_exits_with_refusal_code() {
        let (_dir, log, isolation, _host, launcher) = fixture(FakeIsolation::with_namespace_pid(42));
        let _ = launcher.launch(&tag_script(), &log).unwrap_err();
        assert_eq!(isolation.exit_code(isolation.last_pid()), Some(LAUNCH_REFUSED_EXIT_CODE));
    }

    #[test]
    fn spawn_failure_is_launch_error() {
        let (_dir, log, _isolation, host, launcher) = fixture(FakeIsolation::failing_spawn());
        let err = launcher.launch(&tag_script(), &log).unwrap_err();
        assert!(matches!(err, DiskforgeError::Launch { .. }));
        assert!(host.commands().is_empty());
    }

    #[test]
    fn successful_launch_runs_command_as_pid_one() {
        let (_dir, log, _isolation, host, launcher) = fixture(FakeIsolation::new());

        let process = launcher.launch(&tag_script(), &log).expect("launch");

        assert_eq!(process.namespace_pid(), 1);
        assert_eq!(host.commands(), vec![tag_script().to_string()]);
        assert!(log.tail(10).iter().any(|l| l.contains("CONTAINED COMMAND")));
    }

    #[test]
    fn empty_namespace_gets_sigterm_only() {
        let (_dir, log, isolation, _host, launcher) = fixture(FakeIsolation::new());
        let _process = launcher.launch(&tag_script(), &log).expect("launch");

        assert_eq!(isolation.events(), vec![IsolationEvent::Signal(GroupSignal::Terminate)]);
    }

    #[test]
    fn survivors_get_sigkill_after_grace_period() {
        let (_dir, log, isolation, _host, launcher) =
            fixture(FakeIsolation::new().with_survivors(true, true));
        let _process = launcher.launch(&tag_script(), &log).expect("launch");

        assert_eq!(
            isolation.events(),
            vec![
                IsolationEvent::Signal(GroupSignal::Terminate),
                IsolationEvent::Sleep(Duration::from_secs(2)),
                IsolationEvent::Signal(GroupSignal::Kill),
            ]
        );
        assert!(log.tail(3).iter().any(|l| l.ends_with("some processes remained to SIGKILL")));
    }

    #[test]
    fn processes_leaving_during_grace_are_reported_clean() {
        let (_dir, log, isolation, _host, launcher) =
            fixture(FakeIsolation::new().with_survivors(true, false));
        let _process = launcher.launch(&tag_script(), &log).expect("launch");

        assert_eq!(isolation.signals(), vec![GroupSignal::Terminate, GroupSignal::Kill]);
        assert!(log.tail(1)[0].ends_with("all processes properly terminated"));
    }

    #[test]
    fn failed_command_still_escalates_and_exits_nonzero() {
        let (_dir, log, isolation, host, launcher) =
            fixture(FakeIsolation::new().with_survivors(true, true));
        host.fail_on("tag-script");

        let process = launcher.launch(&tag_script(), &log).expect("launch");

        assert_eq!(isolation.signals(), vec![GroupSignal::Terminate, GroupSignal::Kill]);
        assert_eq!(isolation.exit_code(process.host_pid()), Some(1));
        assert!(log.tail(10).iter().any(|l| l.contains("ERROR exit code from contained command")));
    }

    #[test]
    fn report_pipe_is_close_on_exec() {
        use nix::fcntl::{FcntlArg, FdFlag, fcntl};

        let (rx, tx) = report_pipe().expect("pipe");
        for end in [&rx, &tx] {
            let flags = fcntl(end, FcntlArg::F_GETFD).expect("F_GETFD");
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }
}
