//! Diagnostic log for one build session.
//!
//! Every external command invocation is recorded here and every external
//! command's standard error is redirected into the same file. When a build
//! fails, the last lines of this log travel with the error.

use std::fmt::Display;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use diskforge_common::error::{DiskforgeError, Result};

/// Append-only diagnostic log backed by a file.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: File,
}

impl LogSink {
    /// Creates a fresh `mke.*.log` file inside `dir`.
    ///
    /// The file outlives the sink so it can be inspected after the build.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create_in(dir: &Path) -> Result<Self> {
        let (file, path) = tempfile::Builder::new()
            .prefix("mke.")
            .suffix(".log")
            .tempfile_in(dir)
            .and_then(|f| f.keep().map_err(|e| e.error))
            .map_err(|e| DiskforgeError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;
        tracing::debug!(path = %path.display(), "diagnostic log created");
        Ok(Self { path, file })
    }

    /// Opens `path` for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DiskforgeError::Io {
                path: path.clone(),
                source: e,
            })?;
        Ok(Self { path, file })
    }

    /// Returns the path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one timestamped line.
    ///
    /// Never fails: a diagnostic that cannot be written must not change the
    /// outcome of the operation being diagnosed.
    pub fn record(&self, line: impl Display) {
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        if let Err(e) = writeln!(&self.file, "{stamp} {line}") {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write diagnostic log");
        }
    }

    /// Returns a handle suitable for a child's stdout or stderr.
    ///
    /// # Errors
    ///
    /// Returns an error if the file descriptor cannot be duplicated.
    pub fn stdio(&self) -> Result<Stdio> {
        self.file
            .try_clone()
            .map(Stdio::from)
            .map_err(|e| DiskforgeError::Io {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Returns the last `lines` lines of the log.
    ///
    /// An unreadable log yields an empty tail.
    #[must_use]
    pub fn tail(&self, lines: usize) -> Vec<String> {
        let Ok(content) = std::fs::read(&self.path) else {
            return Vec::new();
        };
        let content = String::from_utf8_lossy(&content);
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].iter().map(ToString::to_string).collect()
    }
}
