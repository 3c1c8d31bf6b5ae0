//! `diskforge contain`: run one command as the init of a fresh PID
//! namespace.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use diskforge_common::constants::{DEFAULT_BASE_DIR, DEFAULT_LOG_TAIL_LINES};
use diskforge_core::command::{CommandSpec, SystemRunner};
use diskforge_core::launcher::Launcher;
use diskforge_core::log_sink::LogSink;
use diskforge_core::namespace::pid::LinuxIsolation;
use diskforge_core::supervisor::Supervisor;

use crate::output;

/// Arguments for the `contain` command.
#[derive(Args, Debug)]
pub struct ContainArgs {
    /// Milliseconds between SIGTERM and SIGKILL when clearing the namespace.
    #[arg(long, default_value_t = 2000)]
    pub grace_ms: u64,

    /// Directory receiving the diagnostic log.
    #[arg(long, default_value = DEFAULT_BASE_DIR)]
    pub log_dir: PathBuf,

    /// Command to run.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `contain` command.
///
/// # Errors
///
/// Returns an error if the process cannot be launched, exits non-zero, or
/// is killed by a signal.
pub fn execute(args: &ContainArgs) -> anyhow::Result<()> {
    let command = CommandSpec::from_argv(&args.command)?;
    let log = LogSink::create_in(&args.log_dir)?;
    let isolation = Arc::new(LinuxIsolation::new());

    let launcher = Launcher::new(isolation.clone(), Arc::new(SystemRunner::new(DEFAULT_LOG_TAIL_LINES)))
        .with_grace_period(Duration::from_millis(args.grace_ms));
    let result = launcher
        .launch(&command, &log)
        .and_then(|process| Supervisor::new(isolation).supervise(process, &log));

    match result {
        Ok(status) => {
            tracing::info!(host_pid = status.host_pid, log = %log.path().display(), "contained command finished");
            Ok(())
        }
        Err(e) => {
            if let Some(tail) = e.log_tail() {
                output::print_log_tail(tail);
            }
            Err(e.into())
        }
    }
}
