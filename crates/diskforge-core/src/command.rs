//! The external-command capability.
//!
//! Every host tool the image build depends on (`dd`, `parted`, `kpartx`,
//! `mount`, ...) is invoked through [`CommandRunner`]. The runner records the
//! invocation in the diagnostic log, redirects standard error into it, and
//! turns a non-zero exit into `DiskforgeError::CommandFailed` carrying the
//! log tail.

use std::fmt;
use std::process::Stdio;

use diskforge_common::constants::DEFAULT_LOG_TAIL_LINES;
use diskforge_common::error::{DiskforgeError, Result};

use crate::log_sink::LogSink;

/// An argument vector for one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    /// Starts a command line with the given program.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Builds a command from a full argument vector.
    ///
    /// # Errors
    ///
    /// Returns `DiskforgeError::Config` if the vector is empty.
    pub fn from_argv<S: AsRef<str>>(argv: &[S]) -> Result<Self> {
        let (program, rest) = argv.split_first().ok_or_else(|| DiskforgeError::Config {
            message: "command is empty".into(),
        })?;
        Ok(Self::new(program.as_ref()).args(rest.iter().map(AsRef::as_ref)))
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Returns the program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the arguments after the program name.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Where a command's standard streams go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Stdout is captured and returned; stderr goes to the log.
    Captured,
    /// Stdout and stderr both go to the log.
    Logged,
    /// Stdout is shown to the operator; stderr goes to the log.
    Foreground,
    /// All streams are connected to the operator's terminal.
    Interactive,
}

/// Runs external commands synchronously.
pub trait CommandRunner: Send + Sync {
    /// Runs `command` to completion and returns its captured stdout.
    ///
    /// Stdout is only captured in [`OutputMode::Captured`]; other modes
    /// return an empty string.
    ///
    /// # Errors
    ///
    /// Returns `DiskforgeError::CommandFailed` for a non-zero exit, or
    /// `DiskforgeError::Io` if the program cannot be started.
    fn run(&self, command: &CommandSpec, log: &LogSink, mode: OutputMode) -> Result<String>;
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    tail_lines: usize,
}

impl SystemRunner {
    /// Creates a runner that attaches `tail_lines` log lines to failures.
    #[must_use]
    pub const fn new(tail_lines: usize) -> Self {
        Self { tail_lines }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_TAIL_LINES)
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandSpec, log: &LogSink, mode: OutputMode) -> Result<String> {
        log.record(format!("RUNNING COMMAND: \"{command}\""));
        tracing::info!(%command, ?mode, "running command");

        let mut cmd = std::process::Command::new(command.program());
        let _ = cmd.args(command.arguments()).stdin(Stdio::null());
        match mode {
            OutputMode::Captured => {
                let _ = cmd.stdout(Stdio::piped()).stderr(log.stdio()?);
            }
            OutputMode::Logged => {
                let _ = cmd.stdout(log.stdio()?).stderr(log.stdio()?);
            }
            OutputMode::Foreground => {
                let _ = cmd.stdout(Stdio::inherit()).stderr(log.stdio()?);
            }
            OutputMode::Interactive => {
                let _ = cmd
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
        }

        let output = cmd.output().map_err(|e| DiskforgeError::Io {
            path: command.program().into(),
            source: e,
        })?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            tracing::warn!(%command, code, "command failed");
            return Err(DiskforgeError::CommandFailed {
                command: command.to_string(),
                code,
                log_tail: log.tail(self.tail_lines),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (tempfile::TempDir, LogSink) {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = LogSink::open(dir.path().join("run.log")).expect("open");
        (dir, sink)
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let cmd = CommandSpec::new("sh").args(["-c", "echo hi"]);
        assert_eq!(cmd.to_string(), "sh -c 'echo hi'");
    }

    #[test]
    fn from_argv_rejects_empty_vector() {
        let empty: [&str; 0] = [];
        assert!(CommandSpec::from_argv(&empty).is_err());
    }

    #[test]
    fn from_argv_splits_program_and_arguments() {
        let cmd = CommandSpec::from_argv(&["losetup", "-d", "/dev/loop0"]).expect("argv");
        assert_eq!(cmd.program(), "losetup");
        assert_eq!(cmd.arguments(), ["-d", "/dev/loop0"]);
    }

    #[test]
    fn captured_mode_returns_stdout() {
        let (_dir, log) = sink();
        let out = SystemRunner::default()
            .run(&CommandSpec::new("echo").arg("mapped"), &log, OutputMode::Captured)
            .expect("echo");
        assert_eq!(out.trim(), "mapped");
    }

    #[test]
    fn invocation_is_recorded_in_log() {
        let (_dir, log) = sink();
        let _ = SystemRunner::default()
            .run(&CommandSpec::new("true"), &log, OutputMode::Logged)
            .expect("true");
        assert!(log.tail(1)[0].ends_with("RUNNING COMMAND: \"true\""));
    }

    #[test]
    fn failure_carries_exit_code_and_stderr_tail() {
        let (_dir, log) = sink();
        let cmd = CommandSpec::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        let err = SystemRunner::default()
            .run(&cmd, &log, OutputMode::Captured)
            .unwrap_err();
        match err {
            DiskforgeError::CommandFailed { code, log_tail, .. } => {
                assert_eq!(code, 3);
                assert_eq!(log_tail.last().map(String::as_str), Some("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_program_is_io_error() {
        let (_dir, log) = sink();
        let err = SystemRunner::default()
            .run(
                &CommandSpec::new("diskforge-no-such-tool"),
                &log,
                OutputMode::Captured,
            )
            .unwrap_err();
        assert!(matches!(err, DiskforgeError::Io { .. }));
    }
}
