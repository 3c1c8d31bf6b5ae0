//! Image build orchestration.
//!
//! [`ImageBuilder::build`] drives one [`BuildContext`] through the forward
//! steps and always tears it down exactly once, whatever step failed.

use std::path::PathBuf;

use diskforge_common::config::BuildConfig;
use diskforge_common::constants::REQUIRED_TOOLS;
use diskforge_common::error::{DiskforgeError, Result};
use diskforge_common::types::BuildId;
use diskforge_core::preflight::missing_tools;

use crate::context::{BuildContext, HostServices};

/// What to build on top of the configuration.
#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    /// Build configuration.
    pub config: BuildConfig,
    /// System model installed into the image; also keys the cache.
    pub model: Option<PathBuf>,
    /// Tarball spec unpacked before the installer runs.
    pub pre_image: Option<String>,
    /// Tarball spec unpacked after the trigger script.
    pub post_image: Option<String>,
    /// Write clock, locale and keyboard configuration.
    pub post_config: bool,
    /// Run `bootman` after writing the bootloader configuration.
    pub bootman: bool,
    /// Move passwords into the shadow file.
    pub convert_passwords: bool,
    /// Clear the root password.
    pub unset_root_password: bool,
    /// Shell command run inside the finished root.
    pub post_script: Option<String>,
    /// Also archive the root into a tarball.
    pub tarball: bool,
}

/// Artifacts of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Build identifier.
    pub id: BuildId,
    /// The disk image.
    pub image: PathBuf,
    /// The diagnostic log.
    pub log: PathBuf,
    /// Root tarball, when requested.
    pub tarball: Option<PathBuf>,
    /// Image size in bytes.
    pub size_bytes: u64,
}

/// Builds disk images against a set of host services.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    host: HostServices,
}

impl ImageBuilder {
    /// Creates a builder over the given host services.
    #[must_use]
    pub const fn new(host: HostServices) -> Self {
        Self { host }
    }

    /// Creates a builder over the real host.
    #[must_use]
    pub fn system(config: &BuildConfig) -> Self {
        Self::new(HostServices::system(config.log_tail_lines))
    }

    /// Checks that every host tool the pipeline shells out to is on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `DiskforgeError::Config` listing the missing tools.
    pub fn preflight() -> Result<()> {
        let missing = missing_tools(REQUIRED_TOOLS);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DiskforgeError::Config {
                message: format!("missing host tools: {}", missing.join(", ")),
            })
        }
    }

    /// Runs a complete build.
    ///
    /// Teardown runs once on both paths. Release failures are logged and
    /// never replace the result: a failed build returns the error of the
    /// step that failed, always with the diagnostic log's tail.
    ///
    /// # Errors
    ///
    /// Returns the first failing forward step's error.
    pub fn build(&self, plan: &BuildPlan) -> Result<BuildOutcome> {
        let mut ctx = BuildContext::create(plan.config.clone(), self.host.clone())?;
        tracing::info!(build = %ctx.id(), size_mib = plan.config.size_mib, "build started");

        let forward = run_steps(&mut ctx, plan).map_err(|e| {
            let e = e.with_log_tail(ctx.log().tail(plan.config.log_tail_lines));
            ctx.log().record(format!("BUILD FAILED: {e}"));
            e
        });
        if forward.is_err() && plan.config.inspect_failure {
            ctx.root_shell();
        }

        let report = ctx.teardown();
        if !report.is_clean() {
            let failed: Vec<&str> = report.failed.iter().map(|(label, _)| label.as_str()).collect();
            tracing::warn!(build = %ctx.id(), ?failed, "teardown left resources behind");
        }

        match forward {
            Ok(tarball) => {
                tracing::info!(build = %ctx.id(), image = %ctx.image().display(), "build finished");
                Ok(BuildOutcome {
                    id: ctx.id().clone(),
                    image: ctx.image().to_path_buf(),
                    log: ctx.log().path().to_path_buf(),
                    tarball,
                    size_bytes: plan.config.size_bytes(),
                })
            }
            Err(e) => {
                tracing::error!(
                    build = %ctx.id(),
                    log = %ctx.log().path().display(),
                    tail = ?e.log_tail().unwrap_or_default(),
                    error = %e,
                    "build failed"
                );
                Err(e)
            }
        }
    }
}

/// Forward steps, in acquisition order. Returns the root tarball if one
/// was made.
fn run_steps(ctx: &mut BuildContext, plan: &BuildPlan) -> Result<Option<PathBuf>> {
    ctx.allocate_image()?;
    ctx.partition_image()?;
    ctx.attach_loop()?;
    ctx.create_filesystem()?;
    ctx.mount_filesystem()?;

    ctx.populate_skeleton(plan.model.as_deref())?;
    ctx.mount_pseudo_filesystems()?;
    ctx.mount_package_db()?;

    if let Some(spec) = &plan.pre_image {
        ctx.install_tarball_spec(spec)?;
    }
    if !ctx.config().install_command.is_empty() {
        ctx.install_system()?;
    }
    ctx.run_trigger_script()?;
    if let Some(spec) = &plan.post_image {
        ctx.install_tarball_spec(spec)?;
    }

    if plan.post_config {
        let config = ctx.config();
        let (timezone, lang, keytable) = (
            config.timezone.clone(),
            config.lang.clone(),
            config.keytable.clone(),
        );
        ctx.write_post_config(&timezone, &lang, &keytable)?;
    }
    if let Some(level) = ctx.config().initlevel {
        ctx.set_initlevel(level)?;
    }
    if ctx.root_path("lib/modules")?.is_dir() {
        ctx.create_bootloader_conf()?;
        if plan.bootman {
            ctx.run_bootman()?;
        }
        ctx.create_initrd()?;
    } else {
        tracing::info!("no kernel installed, skipping bootloader configuration and initrd");
    }
    if plan.convert_passwords {
        ctx.convert_passwords()?;
    }
    if plan.unset_root_password {
        ctx.unset_root_password()?;
    }
    if let Some(script) = &plan.post_script {
        ctx.run_post_script(script)?;
    }

    ctx.finish_filesystem()?;
    if plan.tarball {
        return ctx.create_tarball().map(Some);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use diskforge_core::testing::{FakeHost, FakeIsolation};

    use super::*;

    fn builder(host: &Arc<FakeHost>) -> ImageBuilder {
        ImageBuilder::new(HostServices {
            runner: host.clone(),
            probe: host.clone(),
            isolation: Arc::new(FakeIsolation::new()),
        })
    }

    fn plan(base: &std::path::Path) -> BuildPlan {
        BuildPlan {
            config: BuildConfig {
                base_dir: base.to_path_buf(),
                size_mib: 100,
                tmpfs_package_db: false,
                ..BuildConfig::default()
            },
            ..BuildPlan::default()
        }
    }

    #[test]
    fn invalid_config_fails_before_touching_the_host() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = Arc::new(FakeHost::new());
        let mut plan = plan(dir.path());
        plan.config.size_mib = 0;

        let err = builder(&host).build(&plan).unwrap_err();

        assert!(matches!(err, DiskforgeError::Config { .. }));
        assert!(host.commands().is_empty());
    }

    #[test]
    fn failed_partitioning_leaves_nothing_attached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = Arc::new(FakeHost::new());
        host.fail_on("parted");

        let err = builder(&host).build(&plan(dir.path())).unwrap_err();

        assert!(matches!(err, DiskforgeError::ResourceAcquisition { step: "partition", .. }));
        assert!(!host.commands().iter().any(|c| c.starts_with("kpartx")));
    }

    #[test]
    fn successful_build_unmounts_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = Arc::new(FakeHost::new());

        let outcome = builder(&host).build(&plan(dir.path())).expect("build");

        assert!(outcome.image.is_file());
        assert!(outcome.log.is_file());
        assert_eq!(outcome.size_bytes, 100 * 1024 * 1024);
        assert!(outcome.tarball.is_none());
        assert!(host.mounts().is_empty());
        assert!(host.mappings().is_empty());
        assert!(host.loops().is_empty());
    }
}
