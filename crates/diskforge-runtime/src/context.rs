//! Per-build state and its guaranteed teardown.
//!
//! A [`BuildContext`] owns everything one image build acquires: the backing
//! image, the temporary root directory, the partition mappings and the
//! mounts on it. Each acquisition registers a release on the context's
//! [`ResourceStack`]; [`BuildContext::teardown`] runs them once, newest
//! first, and `Drop` runs it if nobody else did.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use diskforge_common::config::BuildConfig;
use diskforge_common::error::{DiskforgeError, Result};
use diskforge_common::types::BuildId;
use diskforge_core::command::{CommandRunner, CommandSpec, OutputMode, SystemRunner};
use diskforge_core::filesystem::loopdev::{DeviceProbe, SysfsProbe};
use diskforge_core::launcher::Launcher;
use diskforge_core::log_sink::LogSink;
use diskforge_core::namespace::Isolation;
use diskforge_core::namespace::pid::LinuxIsolation;
use diskforge_core::supervisor::Supervisor;

use crate::resources::{ResourceKind, ResourceStack, TeardownReport};

/// Maps an I/O failure to an error naming `path`.
pub(crate) fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DiskforgeError + '_ {
    move |source| DiskforgeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Host capabilities a build reaches the system through.
#[derive(Clone)]
pub struct HostServices {
    /// Runs external commands.
    pub runner: Arc<dyn CommandRunner>,
    /// Reports which loop and device-mapper devices still exist.
    pub probe: Arc<dyn DeviceProbe>,
    /// Creates and supervises contained processes.
    pub isolation: Arc<dyn Isolation>,
}

impl HostServices {
    /// The real host: `std::process`, sysfs and Linux namespaces.
    #[must_use]
    pub fn system(tail_lines: usize) -> Self {
        Self {
            runner: Arc::new(SystemRunner::new(tail_lines)),
            probe: Arc::new(SysfsProbe),
            isolation: Arc::new(LinuxIsolation::new()),
        }
    }
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices").finish_non_exhaustive()
    }
}

/// State of one image build.
#[derive(Debug)]
pub struct BuildContext {
    pub(crate) id: BuildId,
    pub(crate) config: BuildConfig,
    pub(crate) host: HostServices,
    pub(crate) log: Arc<LogSink>,
    pub(crate) image: PathBuf,
    pub(crate) mountpoint: PathBuf,
    pub(crate) mount_device: PathBuf,
    pub(crate) mappings: Vec<PathBuf>,
    pub(crate) root_dir: Option<PathBuf>,
    pub(crate) package_db_mounted: bool,
    pub(crate) system_model: Option<Vec<u8>>,
    pub(crate) kernel_version: Option<String>,
    pub(crate) resources: ResourceStack,
    acquired: Vec<&'static str>,
    torn_down: bool,
}

impl BuildContext {
    /// Creates the diagnostic log, the empty backing image and the `mkd.*`
    /// root directory in the configured base directory.
    ///
    /// The log and the image are outputs of the build and survive teardown.
    /// The root directory's removal is the first release registered, so it
    /// runs last, once everything mounted on it is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or any of the three
    /// cannot be created.
    pub fn create(config: BuildConfig, host: HostServices) -> Result<Self> {
        config.validate()?;
        let base = config.base_dir.clone();
        std::fs::create_dir_all(&base).map_err(|e| DiskforgeError::Io {
            path: base.clone(),
            source: e,
        })?;

        let log = Arc::new(LogSink::create_in(&base)?);
        let (_, image) = tempfile::Builder::new()
            .prefix("mki.")
            .suffix(".img")
            .tempfile_in(&base)
            .and_then(|f| f.keep().map_err(|e| e.error))
            .map_err(|e| DiskforgeError::Io {
                path: base.clone(),
                source: e,
            })?;

        let mountpoint = tempfile::Builder::new()
            .prefix("mkd.")
            .tempdir_in(&base)
            .map_err(|e| DiskforgeError::Io {
                path: base.clone(),
                source: e,
            })?
            .keep();
        let mut resources = ResourceStack::new();
        let removed = mountpoint.clone();
        resources.push(ResourceKind::RootDir, "remove root directory", move || {
            std::fs::remove_dir(&removed).map_err(|e| DiskforgeError::Io {
                path: removed.clone(),
                source: e,
            })
        });

        let id = BuildId::generate();
        tracing::info!(
            build = %id,
            image = %image.display(),
            log = %log.path().display(),
            "build context created"
        );
        Ok(Self {
            id,
            config,
            host,
            log,
            mount_device: image.clone(),
            image,
            mountpoint,
            mappings: Vec::new(),
            root_dir: None,
            package_db_mounted: false,
            system_model: None,
            kernel_version: None,
            resources,
            acquired: Vec::new(),
            torn_down: false,
        })
    }

    /// Identifier of this build.
    #[must_use]
    pub const fn id(&self) -> &BuildId {
        &self.id
    }

    /// Configuration the build runs with.
    #[must_use]
    pub const fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// The backing image file.
    #[must_use]
    pub fn image(&self) -> &Path {
        &self.image
    }

    /// The diagnostic log.
    #[must_use]
    pub fn log(&self) -> &LogSink {
        &self.log
    }

    /// Device the filesystem is created on: the image itself until
    /// partitions are mapped, then the first partition mapping.
    #[must_use]
    pub fn mount_device(&self) -> &Path {
        &self.mount_device
    }

    /// Partition mappings created for the image.
    #[must_use]
    pub fn mappings(&self) -> &[PathBuf] {
        &self.mappings
    }

    /// Acquisition steps that completed, in order.
    #[must_use]
    pub fn acquired(&self) -> &[&'static str] {
        &self.acquired
    }

    /// Pending release steps.
    #[must_use]
    pub const fn resources(&self) -> &ResourceStack {
        &self.resources
    }

    /// The mounted image root.
    ///
    /// # Errors
    ///
    /// Returns `DiskforgeError::Config` if the root filesystem is not
    /// mounted yet.
    pub fn root_dir(&self) -> Result<&Path> {
        self.root_dir.as_deref().ok_or_else(|| DiskforgeError::Config {
            message: "image root filesystem is not mounted".into(),
        })
    }

    /// Resolves a root-relative path inside the image.
    ///
    /// # Errors
    ///
    /// Returns an error if the root filesystem is not mounted.
    pub fn root_path(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        let relative = relative.strip_prefix("/").unwrap_or(relative);
        Ok(self.root_dir()?.join(relative))
    }

    /// Runs `command` with stdout captured.
    pub(crate) fn run(&self, command: &CommandSpec) -> Result<String> {
        self.host.runner.run(command, &self.log, OutputMode::Captured)
    }

    /// Runs `command` with the given stream handling.
    pub(crate) fn run_mode(&self, command: &CommandSpec, mode: OutputMode) -> Result<String> {
        self.host.runner.run(command, &self.log, mode)
    }

    /// Launches `command` in a fresh PID namespace and waits for it.
    pub(crate) fn run_contained(&self, command: &CommandSpec) -> Result<()> {
        let launcher = Launcher::new(
            Arc::clone(&self.host.isolation),
            Arc::clone(&self.host.runner),
        )
        .with_grace_period(self.config.grace_period());
        let process = launcher.launch(command, &self.log)?;
        let _ = Supervisor::new(Arc::clone(&self.host.isolation))
            .with_tail_lines(self.config.log_tail_lines)
            .supervise(process, &self.log)?;
        Ok(())
    }

    /// Runs one acquisition step, tagging its failure with the step name.
    pub(crate) fn acquire<T>(
        &mut self,
        step: &'static str,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        tracing::info!(build = %self.id, step, "acquiring");
        match body(self) {
            Ok(value) => {
                self.acquired.push(step);
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(build = %self.id, step, error = %e, "acquisition failed");
                Err(DiskforgeError::acquisition(step, e))
            }
        }
    }

    /// Registers `command` as the release of the resource just acquired.
    pub(crate) fn push_release_command(
        &mut self,
        kind: ResourceKind,
        label: impl Into<String>,
        command: CommandSpec,
    ) {
        let runner = Arc::clone(&self.host.runner);
        let log = Arc::clone(&self.log);
        self.resources.push(kind, label, move || {
            runner.run(&command, &log, OutputMode::Captured).map(drop)
        });
    }

    /// Releases everything still held, newest first.
    ///
    /// Every release step runs even if earlier ones fail; failures are
    /// logged and collected in the report. Only the first call does any
    /// work.
    pub fn teardown(&mut self) -> TeardownReport {
        if self.torn_down {
            return TeardownReport::default();
        }
        self.torn_down = true;
        self.log.record(format!("TEARDOWN of {} resources", self.resources.len()));

        let report = self.resources.teardown();
        for (label, error) in &report.failed {
            self.log.record(format!("teardown step failed: {label}: {error}"));
        }
        self.root_dir = None;
        self.package_db_mounted = false;
        tracing::info!(
            build = %self.id,
            released = report.released.len(),
            failed = report.failed.len(),
            "teardown complete"
        );
        report
    }
}

impl Drop for BuildContext {
    fn drop(&mut self) {
        if !self.torn_down {
            let _ = self.teardown();
        }
    }
}
