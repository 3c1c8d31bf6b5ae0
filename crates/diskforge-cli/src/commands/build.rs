//! `diskforge build`: build one disk image.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Args;
use diskforge_common::config::BuildConfig;
use diskforge_common::types::PartitionTable;
use diskforge_runtime::{BuildPlan, ImageBuilder};

use crate::output;

/// Arguments for the `build` command.
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// JSON build configuration; flags override its values.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Image size in MiB.
    #[arg(long)]
    pub size_mib: Option<u64>,

    /// Root filesystem type.
    #[arg(long)]
    pub fstype: Option<String>,

    /// Use a GPT partition table instead of msdos.
    #[arg(long)]
    pub gpt: bool,

    /// System model installed into the image and used as the cache key.
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Tarball unpacked before installation, as `[prefix:]path`.
    #[arg(long)]
    pub pre_image: Option<String>,

    /// Tarball unpacked after the trigger script, as `[prefix:]path`.
    #[arg(long)]
    pub post_image: Option<String>,

    /// Directory receiving the image, the log and the scratch root.
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Directory of the resolution cache.
    #[arg(long, env = "DISKFORGE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Write clock, locale, keyboard and mouse configuration.
    #[arg(long)]
    pub post_config: bool,

    /// Run `bootman` after writing the bootloader configuration.
    #[arg(long)]
    pub bootman: bool,

    /// Move account passwords into the shadow file.
    #[arg(long)]
    pub convert_passwords: bool,

    /// Clear the root password.
    #[arg(long)]
    pub unset_root_password: bool,

    /// Shell command run inside the finished root.
    #[arg(long)]
    pub post_script: Option<String>,

    /// Also archive the root into `image.*.tar.gz`.
    #[arg(long)]
    pub tarball: bool,

    /// Open a shell in the image root before tearing down a failed build.
    #[arg(long)]
    pub inspect_failure: bool,
}

impl BuildArgs {
    fn into_plan(self) -> anyhow::Result<BuildPlan> {
        let mut config = match &self.config {
            Some(path) => BuildConfig::load(path)
                .with_context(|| format!("loading build configuration {}", path.display()))?,
            None => BuildConfig::default(),
        };
        if let Some(size) = self.size_mib {
            config.size_mib = size;
        }
        if let Some(fstype) = self.fstype {
            config.fstype = fstype;
        }
        if self.gpt {
            config.partition_table = PartitionTable::Gpt;
        }
        if let Some(base) = self.base_dir {
            config.base_dir = base;
        }
        if self.cache_dir.is_some() {
            config.cache_dir = self.cache_dir;
        }
        config.inspect_failure |= self.inspect_failure;
        config.validate()?;

        Ok(BuildPlan {
            config,
            model: self.model,
            pre_image: self.pre_image,
            post_image: self.post_image,
            post_config: self.post_config,
            bootman: self.bootman,
            convert_passwords: self.convert_passwords,
            unset_root_password: self.unset_root_password,
            post_script: self.post_script,
            tarball: self.tarball,
        })
    }
}

/// Executes the `build` command.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, host tools are
/// missing, or any build step fails.
pub fn execute(args: BuildArgs) -> anyhow::Result<()> {
    let started = Instant::now();
    let plan = args.into_plan()?;
    ImageBuilder::preflight()?;

    output::print_header();
    let outcome = ImageBuilder::system(&plan.config).build(&plan).map_err(|e| {
        if let Some(tail) = e.log_tail() {
            output::print_log_tail(tail);
        }
        anyhow::Error::new(e)
    })?;

    output::print_outcome(&outcome, started.elapsed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::commands::{Cli, Command};

    fn parse(args: &[&str]) -> BuildArgs {
        let argv = ["diskforge", "build"].iter().chain(args);
        match Cli::parse_from(argv).command {
            Command::Build(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn flags_override_defaults() {
        let plan = parse(&["--size-mib", "100", "--gpt", "--fstype", "ext3", "--tarball"])
            .into_plan()
            .expect("plan");
        assert_eq!(plan.config.size_mib, 100);
        assert_eq!(plan.config.partition_table, PartitionTable::Gpt);
        assert_eq!(plan.config.fstype, "ext3");
        assert!(plan.tarball);
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("build.json");
        std::fs::write(&path, r#"{ "size_mib": 512, "fstype": "xfs" }"#).expect("write");

        let plan = parse(&["--config", path.to_str().expect("utf-8"), "--size-mib", "200"])
            .into_plan()
            .expect("plan");

        assert_eq!(plan.config.size_mib, 200);
        assert_eq!(plan.config.fstype, "xfs");
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(parse(&["--size-mib", "0"]).into_plan().is_err());
    }
}
