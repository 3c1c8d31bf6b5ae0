//! Build configuration model.
//!
//! A [`BuildConfig`] is usually loaded from a JSON file and then adjusted
//! by command-line overrides. Every field has a default so a config file
//! only needs to name what differs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{DiskforgeError, Result};
use crate::types::PartitionTable;

/// Root configuration for one image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Directory that receives the image, the diagnostic log, and the
    /// temporary root directory.
    pub base_dir: PathBuf,
    /// Image size in MiB.
    pub size_mib: u64,
    /// Root filesystem type, passed to `mkfs.<fstype>` and `mount -t`.
    pub fstype: String,
    /// Partition table layout.
    pub partition_table: PartitionTable,
    /// Allocate the image sparsely instead of writing zeroes.
    pub sparse: bool,
    /// Mount options for the root filesystem during population.
    pub mount_options: String,
    /// Keep the package database on tmpfs while installing.
    pub tmpfs_package_db: bool,
    /// Package database directory, relative to the image root.
    pub package_db_dir: PathBuf,
    /// Directory of the content-addressed resolution cache, if any.
    pub cache_dir: Option<PathBuf>,
    /// Milliseconds between SIGTERM and SIGKILL when clearing a namespace.
    pub grace_period_ms: u64,
    /// Diagnostic log lines attached to surfaced errors.
    pub log_tail_lines: usize,
    /// Open an interactive shell in the image root before tearing down a
    /// failed build.
    pub inspect_failure: bool,
    /// Payload install command; `{root}` is replaced by the image root.
    pub install_command: Vec<String>,
    /// Root-relative trigger script run in a contained PID namespace after
    /// installation.
    pub trigger_script: Option<PathBuf>,
    /// Trigger-script section prefixes to drop before running it.
    pub skip_trigger_sections: Vec<String>,
    /// Time zone written to the system clock configuration.
    pub timezone: String,
    /// Default system locale.
    pub lang: String,
    /// Console keyboard table.
    pub keytable: String,
    /// Default init level written to `/etc/inittab`, if any.
    pub initlevel: Option<u8>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(constants::DEFAULT_BASE_DIR),
            size_mib: constants::DEFAULT_SIZE_MIB,
            fstype: constants::DEFAULT_FSTYPE.into(),
            partition_table: PartitionTable::default(),
            sparse: true,
            mount_options: constants::DEFAULT_MOUNT_OPTIONS.into(),
            tmpfs_package_db: true,
            package_db_dir: PathBuf::from(constants::DEFAULT_PACKAGE_DB_DIR),
            cache_dir: None,
            grace_period_ms: u64::try_from(constants::DEFAULT_GRACE_PERIOD.as_millis())
                .unwrap_or(2000),
            log_tail_lines: constants::DEFAULT_LOG_TAIL_LINES,
            inspect_failure: false,
            install_command: Vec::new(),
            trigger_script: None,
            skip_trigger_sections: constants::DEFAULT_SKIP_TRIGGER_SECTIONS
                .iter()
                .map(ToString::to_string)
                .collect(),
            timezone: "UTC".into(),
            lang: "en_US.UTF-8".into(),
            keytable: "us".into(),
            initlevel: None,
        }
    }
}

impl BuildConfig {
    /// Loads a configuration from a JSON file and validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading build configuration");
        let content = std::fs::read_to_string(path).map_err(|e| DiskforgeError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would otherwise fail deep inside the pipeline.
    ///
    /// # Errors
    ///
    /// Returns `DiskforgeError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.size_mib == 0 {
            return Err(config_error("size_mib must be at least 1"));
        }
        if self.size_mib.checked_mul(BYTES_PER_MIB).is_none() {
            return Err(config_error(format!("size_mib too large: {}", self.size_mib)));
        }
        let _ = self.partition_table.partition_bounds(self.size_mib)?;
        if self.fstype.trim().is_empty() || self.fstype.contains(char::is_whitespace) {
            return Err(config_error(format!("invalid fstype: {:?}", self.fstype)));
        }
        if self.package_db_dir.as_os_str().is_empty() || self.package_db_dir.is_absolute() {
            return Err(config_error(format!(
                "package_db_dir must be relative to the image root: {}",
                self.package_db_dir.display()
            )));
        }
        if self.trigger_script.as_deref().is_some_and(Path::is_absolute) {
            return Err(config_error("trigger_script must be relative to the image root"));
        }
        if self.log_tail_lines == 0 {
            return Err(config_error("log_tail_lines must be at least 1"));
        }
        if self.initlevel.is_some_and(|level| level > 6) {
            return Err(config_error("initlevel must be between 0 and 6"));
        }
        Ok(())
    }

    /// Returns the SIGTERM-to-SIGKILL grace period.
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Returns the image size in bytes. Saturates for sizes [`Self::validate`]
    /// rejects.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_mib.saturating_mul(BYTES_PER_MIB)
    }
}

const BYTES_PER_MIB: u64 = 1024 * 1024;

fn config_error(message: impl Into<String>) -> DiskforgeError {
    DiskforgeError::Config {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        BuildConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn default_grace_period_is_two_seconds() {
        assert_eq!(BuildConfig::default().grace_period(), Duration::from_secs(2));
    }

    #[test]
    fn zero_size_is_rejected() {
        let config = BuildConfig {
            size_mib: 0,
            ..BuildConfig::default()
        };
        assert!(matches!(config.validate(), Err(DiskforgeError::Config { .. })));
    }

    #[test]
    fn size_overflowing_byte_count_is_rejected() {
        let config = BuildConfig {
            size_mib: u64::MAX / 1024,
            ..BuildConfig::default()
        };
        assert!(matches!(config.validate(), Err(DiskforgeError::Config { .. })));
        assert_eq!(config.size_bytes(), u64::MAX);
    }

    #[test]
    fn size_too_small_for_a_partition_is_rejected() {
        let config = BuildConfig {
            size_mib: 1,
            ..BuildConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn absolute_package_db_is_rejected() {
        let config = BuildConfig {
            package_db_dir: PathBuf::from("/var/lib/pkgdb"),
            ..BuildConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("build.json");
        std::fs::write(&path, r#"{ "size_mib": 100, "partition_table": "gpt" }"#).expect("write");

        let config = BuildConfig::load(&path).expect("load");
        assert_eq!(config.size_mib, 100);
        assert_eq!(config.partition_table, PartitionTable::Gpt);
        assert_eq!(config.fstype, "ext4");
        assert!(config.tmpfs_package_db);
    }

    #[test]
    fn load_rejects_unknown_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("build.json");
        std::fs::write(&path, r#"{ "sise_mib": 100 }"#).expect("write");
        assert!(matches!(
            BuildConfig::load(&path),
            Err(DiskforgeError::Serialization { .. })
        ));
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = BuildConfig::load(Path::new("/nonexistent/build.json")).unwrap_err();
        assert!(matches!(err, DiskforgeError::Io { ref path, .. } if path.ends_with("build.json")));
    }
}
