//! Namespace isolation for contained commands.
//!
//! The raw process-creation and signalling primitives are reached only
//! through the [`Isolation`] trait, so the launcher and supervisor can be
//! driven by [`pid::LinuxIsolation`] in production and by an in-process fake
//! in tests.

pub mod pid;

use std::time::Duration;

use diskforge_common::error::Result;

/// Signal sent to every process in the contained namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    /// `SIGTERM`: ask processes to exit.
    Terminate,
    /// `SIGKILL`: force processes to exit.
    Kill,
}

/// How a waited-for process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The process exited with the given status code.
    Exited(i32),
    /// The process was terminated by the named signal.
    Signaled(String),
}

/// Platform isolation interface.
///
/// Implementations create the contained process and provide the handful of
/// process primitives the contained init and its supervisor need.
pub trait Isolation: Send + Sync {
    /// Runs `init` as the first process of a new PID namespace and returns
    /// its host-visible PID. The value returned by `init` becomes the
    /// process's exit status.
    ///
    /// # Errors
    ///
    /// Returns `DiskforgeError::Launch` if the process cannot be created.
    fn spawn_isolated(&self, init: &mut dyn FnMut() -> i32) -> Result<i32>;

    /// Returns the calling process's PID as seen in its own PID namespace,
    /// bypassing any libc PID cache.
    fn namespace_pid(&self) -> i32;

    /// Sends `signal` to every process the caller may signal (inside a PID
    /// namespace: every other process in it). Returns whether any process
    /// received it.
    fn signal_all(&self, signal: GroupSignal) -> bool;

    /// Blocks the calling process for `duration`.
    fn sleep(&self, duration: Duration);

    /// Blocks until the process `host_pid` terminates.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be waited for.
    fn wait(&self, host_pid: i32) -> Result<WaitOutcome>;
}
