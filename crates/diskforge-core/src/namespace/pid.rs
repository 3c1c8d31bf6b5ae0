//! PID namespace isolation.
//!
//! [`LinuxIsolation`] creates the contained process with a raw `clone(2)`
//! so the child starts directly as PID 1 of a new PID namespace, without
//! an intermediate `fork`/`exec`.

use std::time::Duration;

use diskforge_common::error::{DiskforgeError, Result};

use super::{GroupSignal, Isolation, WaitOutcome};

/// [`Isolation`] backed by the Linux kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxIsolation;

impl LinuxIsolation {
    /// Creates the Linux isolation backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
impl Isolation for LinuxIsolation {
    fn spawn_isolated(&self, init: &mut dyn FnMut() -> i32) -> Result<i32> {
        use diskforge_common::constants::CLONE_STACK_SIZE;
        use nix::sched::{CloneCb, CloneFlags, clone};

        let mut stack = vec![0u8; CLONE_STACK_SIZE];
        let callback: CloneCb<'_> = Box::new(|| isize::try_from(init()).unwrap_or(1));

        // SAFETY: the child does not share our address space (no CLONE_VM),
        // so it runs `init` on its own copy of `stack` and of every value the
        // callback borrows. SIGCHLD makes the child waitable with waitpid(2).
        let pid = unsafe { clone(callback, &mut stack, CloneFlags::CLONE_NEWPID, Some(libc::SIGCHLD)) }
            .map_err(|e| DiskforgeError::Launch {
                message: format!("clone failed: {e}"),
            })?;
        tracing::debug!(pid = pid.as_raw(), "contained process created");
        Ok(pid.as_raw())
    }

    fn namespace_pid(&self) -> i32 {
        // SAFETY: SYS_getpid takes no arguments and cannot fail. The raw
        // syscall is used because a libc-level PID cache would not know the
        // process was created by a raw clone.
        let pid = unsafe { libc::syscall(libc::SYS_getpid) };
        i32::try_from(pid).unwrap_or(-1)
    }

    fn signal_all(&self, signal: GroupSignal) -> bool {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let signal = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        kill(Pid::from_raw(-1), signal).is_ok()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn wait(&self, host_pid: i32) -> Result<WaitOutcome> {
        use nix::errno::Errno;
        use nix::sys::wait::{WaitStatus, waitpid};
        use nix::unistd::Pid;

        loop {
            match waitpid(Pid::from_raw(host_pid), None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(WaitOutcome::Exited(code)),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return Ok(WaitOutcome::Signaled(signal.as_str().to_string()));
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    return Err(DiskforgeError::Launch {
                        message: format!("waitpid({host_pid}) failed: {e}"),
                    });
                }
            }
        }
    }
}

/// Stub for non-Linux platforms.
///
/// Process creation always fails; PID namespaces require Linux.
#[cfg(not(target_os = "linux"))]
impl Isolation for LinuxIsolation {
    fn spawn_isolated(&self, _init: &mut dyn FnMut() -> i32) -> Result<i32> {
        Err(DiskforgeError::Config {
            message: "Linux required for PID namespace isolation".into(),
        })
    }

    fn namespace_pid(&self) -> i32 {
        i32::try_from(std::process::id()).unwrap_or(-1)
    }

    fn signal_all(&self, _signal: GroupSignal) -> bool {
        false
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn wait(&self, host_pid: i32) -> Result<WaitOutcome> {
        Err(DiskforgeError::Config {
            message: format!("cannot wait for {host_pid}: Linux required"),
        })
    }
}
