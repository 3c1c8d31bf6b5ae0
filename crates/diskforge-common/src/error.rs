//! Unified error types for the diskforge workspace.
//!
//! Every fallible operation in the workspace returns [`DiskforgeError`].
//! Errors that originate from an external tool or a contained process carry
//! the tail of the build's diagnostic log so the operator can triage the
//! failure without opening the log file.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum DiskforgeError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Creating the isolated process failed, or the child did not observe
    /// itself as PID 1 of its namespace.
    #[error("launch failed: {message}")]
    Launch {
        /// Description of the launch failure.
        message: String,
    },

    /// An external tool or contained command exited with a non-zero status.
    #[error("command `{command}` failed with exit code {code}")]
    CommandFailed {
        /// The command line that failed.
        command: String,
        /// Exit code reported by the process.
        code: i32,
        /// Last lines of the diagnostic log.
        log_tail: Vec<String>,
    },

    /// The contained process was terminated by a signal.
    #[error("container {pid} killed by signal {signal}")]
    ContainerKilled {
        /// Host-visible PID of the contained process.
        pid: i32,
        /// Name of the terminating signal.
        signal: String,
        /// Last lines of the diagnostic log.
        log_tail: Vec<String>,
    },

    /// A resource pipeline step could not acquire its resource.
    #[error("failed to acquire {step}: {source}")]
    ResourceAcquisition {
        /// Name of the acquisition step.
        step: &'static str,
        /// The underlying failure.
        source: Box<DiskforgeError>,
    },

    /// A build step failed with an error that carries no log tail of its
    /// own. Displays as the inner error.
    #[error("{source}")]
    Build {
        /// The step's failure.
        source: Box<DiskforgeError>,
        /// Last lines of the diagnostic log when the build failed.
        log_tail: Vec<String>,
    },

    /// A fixed-length boundary write produced fewer bytes than required.
    #[error("short write to {path}: wrote {written} of {expected} bytes")]
    ShortWrite {
        /// File that received the write.
        path: PathBuf,
        /// Bytes actually written.
        written: usize,
        /// Bytes required.
        expected: usize,
    },

    /// A file the build expected to find was absent.
    #[error("{kind} missing: {path}")]
    MissingArtifact {
        /// What kind of artifact was expected.
        kind: &'static str,
        /// Where it was expected.
        path: PathBuf,
    },

    /// One or more release steps of an explicit teardown failed.
    #[error("teardown failed for: {}", failed.join(", "))]
    Teardown {
        /// Labels of the release steps that failed.
        failed: Vec<String>,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl DiskforgeError {
    /// Wraps an error as the failure of a named acquisition step.
    #[must_use]
    pub fn acquisition(step: &'static str, source: Self) -> Self {
        Self::ResourceAcquisition {
            step,
            source: Box::new(source),
        }
    }

    /// Attaches `log_tail` to an error that does not already carry one.
    #[must_use]
    pub fn with_log_tail(self, log_tail: Vec<String>) -> Self {
        if self.log_tail().is_some() {
            return self;
        }
        Self::Build {
            source: Box::new(self),
            log_tail,
        }
    }

    /// Returns the diagnostic log tail attached to this error, if any.
    ///
    /// Acquisition failures report the tail of the error they wrap.
    #[must_use]
    pub fn log_tail(&self) -> Option<&[String]> {
        match self {
            Self::CommandFailed { log_tail, .. }
            | Self::ContainerKilled { log_tail, .. }
            | Self::Build { log_tail, .. } => Some(log_tail),
            Self::ResourceAcquisition { source, .. } => source.log_tail(),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DiskforgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(tail: &[&str]) -> DiskforgeError {
        DiskforgeError::CommandFailed {
            command: "mkfs.ext4 -F -L / /dev/mapper/loop0p1".into(),
            code: 1,
            log_tail: tail.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn command_failed_exposes_log_tail() {
        let err = failed(&["mke2fs: No such device"]);
        assert_eq!(err.log_tail(), Some(&["mke2fs: No such device".to_string()][..]));
    }

    #[test]
    fn acquisition_forwards_inner_log_tail() {
        let err = DiskforgeError::acquisition("filesystem", failed(&["a", "b"]));
        assert_eq!(err.log_tail().map(<[String]>::len), Some(2));
        assert!(err.to_string().starts_with("failed to acquire filesystem"));
    }

    #[test]
    fn config_error_has_no_log_tail() {
        let err = DiskforgeError::Config {
            message: "size must be positive".into(),
        };
        assert!(err.log_tail().is_none());
    }

    #[test]
    fn missing_artifact_gains_log_tail_and_keeps_its_message() {
        let inner = DiskforgeError::MissingArtifact {
            kind: "zoneinfo file",
            path: PathBuf::from("/mnt/root/usr/share/zoneinfo/UTC"),
        };
        let message = inner.to_string();

        let err = inner.with_log_tail(vec!["RUNNING COMMAND: \"mount\"".into()]);

        assert_eq!(err.to_string(), message);
        assert_eq!(err.log_tail().map(<[String]>::len), Some(1));
        assert!(matches!(
            err,
            DiskforgeError::Build { ref source, .. }
                if matches!(**source, DiskforgeError::MissingArtifact { .. })
        ));
    }

    #[test]
    fn existing_log_tail_is_not_replaced() {
        let err = DiskforgeError::acquisition("format", failed(&["mke2fs: No such device"]))
            .with_log_tail(vec!["later".into()]);
        assert!(matches!(err, DiskforgeError::ResourceAcquisition { .. }));
        assert_eq!(err.log_tail(), Some(&["mke2fs: No such device".to_string()][..]));
    }

    #[test]
    fn teardown_error_lists_failed_steps() {
        let err = DiskforgeError::Teardown {
            failed: vec!["unmount /proc".into(), "remove root dir".into()],
        };
        assert_eq!(
            err.to_string(),
            "teardown failed for: unmount /proc, remove root dir"
        );
    }
}
