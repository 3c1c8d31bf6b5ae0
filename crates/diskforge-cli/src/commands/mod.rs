//! CLI command definitions and dispatch.

pub mod build;
pub mod check;
pub mod contain;
pub mod digest;

use clap::{Parser, Subcommand, ValueEnum};

/// diskforge: disk image builder with contained script execution.
#[derive(Parser, Debug)]
#[command(name = "diskforge", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Format of diagnostic output on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Diagnostic output format.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a disk image.
    Build(build::BuildArgs),
    /// Run one command as PID 1 of a fresh PID namespace.
    Contain(contain::ContainArgs),
    /// Print the cache key of a system model file.
    Digest(digest::DigestArgs),
    /// Check that the host tools a build needs are installed.
    Check,
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Build(args) => build::execute(args),
        Command::Contain(args) => contain::execute(&args),
        Command::Digest(args) => digest::execute(&args),
        Command::Check => check::execute(),
    }
}
