//! Waiting for a contained process and classifying how it ended.

use std::sync::Arc;

use diskforge_common::constants::DEFAULT_LOG_TAIL_LINES;
use diskforge_common::error::{DiskforgeError, Result};

use crate::launcher::ContainedProcess;
use crate::log_sink::LogSink;
use crate::namespace::{Isolation, WaitOutcome};

/// Exit status of a contained process that completed successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Host-visible PID the process had.
    pub host_pid: i32,
    /// Exit code. Always 0 for a status returned by `supervise`.
    pub code: i32,
}

/// Blocks on contained processes until they terminate.
pub struct Supervisor {
    isolation: Arc<dyn Isolation>,
    tail_lines: usize,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("tail_lines", &self.tail_lines)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Creates a supervisor over the given isolation backend.
    pub fn new(isolation: Arc<dyn Isolation>) -> Self {
        Self {
            isolation,
            tail_lines: DEFAULT_LOG_TAIL_LINES,
        }
    }

    /// Sets how many log lines are attached to failures.
    #[must_use]
    pub const fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    /// Waits for `process` to terminate.
    ///
    /// Nothing is retried; every failure is reported to the caller.
    ///
    /// # Errors
    ///
    /// - `DiskforgeError::CommandFailed` if it exited with a non-zero code.
    /// - `DiskforgeError::ContainerKilled` if a signal terminated it.
    /// - `DiskforgeError::Launch` if it could not be waited for.
    pub fn supervise(&self, process: ContainedProcess, log: &LogSink) -> Result<ExitStatus> {
        let host_pid = process.host_pid();
        log.record(format!("{} WAITING for {host_pid}...", std::process::id()));
        tracing::debug!(host_pid, "waiting for contained process");

        match self.isolation.wait(host_pid)? {
            WaitOutcome::Exited(0) => {
                log.record(format!("{host_pid} terminated with exit status 0"));
                tracing::info!(host_pid, "contained command succeeded");
                Ok(ExitStatus { host_pid, code: 0 })
            }
            WaitOutcome::Exited(code) => {
                log.record(format!("{host_pid} terminated with exit status {code}"));
                tracing::warn!(host_pid, code, "contained command failed");
                Err(DiskforgeError::CommandFailed {
                    command: process.command().to_string(),
                    code,
                    log_tail: log.tail(self.tail_lines),
                })
            }
            WaitOutcome::Signaled(signal) => {
                log.record(format!("{host_pid} killed by {signal}"));
                tracing::warn!(host_pid, %signal, "contained process killed");
                Err(DiskforgeError::ContainerKilled {
                    pid: host_pid,
                    signal,
                    log_tail: log.tail(self.tail_lines),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSpec;
    use crate::launcher::Launcher;
    use crate::testing::{FakeHost, FakeIsolation};

    struct Fixture {
        _dir: tempfile::TempDir,
        log: LogSink,
        isolation: Arc<FakeIsolation>,
        host: Arc<FakeHost>,
    }

    impl Fixture {
        fn new(isolation: FakeIsolation) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let log = LogSink::open(dir.path().join("supervise.log")).expect("log");
            Self {
                _dir: dir,
                log,
                isolation: Arc::new(isolation),
                host: Arc::new(FakeHost::new()),
            }
        }

        fn run(&self, command: &CommandSpec) -> Result<ExitStatus> {
            let launcher = Launcher::new(self.isolation.clone(), self.host.clone());
            let process = launcher.launch(command, &self.log)?;
            Supervisor::new(self.isolation.clone())
                .with_tail_lines(4)
                .supervise(process, &self.log)
        }
    }

    fn ldconfig() -> CommandSpec {
        CommandSpec::new("chroot").args(["/mnt/root", "/sbin/ldconfig"])
    }

    #[test]
    fn zero_exit_is_success() {
        let fx = Fixture::new(FakeIsolation::new());
        let status = fx.run(&ldconfig()).expect("supervise");
        assert_eq!(status.code, 0);
        assert!(fx.log.tail(1)[0].ends_with("terminated with exit status 0"));
    }

    #[test]
    fn nonzero_exit_is_command_failed_with_tail() {
        let fx = Fixture::new(FakeIsolation::new());
        fx.host.fail_on("ldconfig");

        let err = fx.run(&ldconfig()).unwrap_err();
        match err {
            DiskforgeError::CommandFailed { code, log_tail, .. } => {
                assert_eq!(code, 1);
                assert_eq!(log_tail.len(), 4);
                assert!(log_tail.iter().any(|l| l.contains("terminated with exit status 1")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn signal_termination_is_container_killed() {
        let fx = Fixture::new(FakeIsolation::new().killed_by("SIGKILL"));
        let err = fx.run(&ldconfig()).unwrap_err();
        assert!(matches!(
            err,
            DiskforgeError::ContainerKilled { ref signal, .. } if signal == "SIGKILL"
        ));
    }
}
