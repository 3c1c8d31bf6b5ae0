//! Backing image, partition table, device mappings and filesystem.

use std::path::PathBuf;
use std::sync::Arc;

use diskforge_common::error::{DiskforgeError, Result};
use diskforge_common::types::PartitionTable;
use diskforge_core::command::{CommandSpec, OutputMode};
use diskforge_core::filesystem::loopdev::{loop_device_for, parse_kpartx_mappings};

use crate::context::BuildContext;
use crate::resources::ResourceKind;

impl BuildContext {
    /// Sizes the backing image with `dd`, sparse unless configured
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceAcquisition` error for step `allocate`.
    pub fn allocate_image(&mut self) -> Result<()> {
        self.acquire("allocate", |ctx| {
            let size = ctx.config.size_mib;
            let mut dd = CommandSpec::new("dd").args([
                "if=/dev/zero".to_string(),
                format!("of={}", ctx.image.display()),
                "bs=1M".to_string(),
            ]);
            dd = if ctx.config.sparse {
                dd.args([format!("seek={size}"), "count=0".to_string()])
            } else {
                dd.arg(format!("count={size}"))
            };
            ctx.run(&dd).map(drop)
        })
    }

    /// Writes a partition table with one bootable primary partition
    /// spanning the disk.
    ///
    /// GPT disks also get the legacy BIOS bootable attribute, which
    /// extlinux needs.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceAcquisition` error for step `partition`.
    pub fn partition_image(&mut self) -> Result<()> {
        self.acquire("partition", |ctx| {
            let table = ctx.config.partition_table;
            let (first, last) = table.partition_bounds(ctx.config.size_mib)?;
            let image = ctx.image.display().to_string();
            let parted = CommandSpec::new("parted").args([
                "--script".to_string(),
                image.clone(),
                "unit".into(),
                "s".into(),
                "mklabel".into(),
                table.label().into(),
                "mkpart".into(),
                "primary".into(),
                first.to_string(),
                last.to_string(),
                "set".into(),
                "1".into(),
                "boot".into(),
                "on".into(),
            ]);
            let _ = ctx.run(&parted)?;
            if table == PartitionTable::Gpt {
                let _ = ctx.run(&CommandSpec::new("sgdisk").args([image, "--attributes=1:set:2".into()]))?;
            }
            Ok(())
        })
    }

    /// Maps the image's partitions with `kpartx` and makes the first one
    /// the mount device.
    ///
    /// Registers three releases, run in reverse: `kpartx -d`, then
    /// `dmsetup remove` for any mapping that survived it, then
    /// `losetup -d` for any loop device still attached.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceAcquisition` error for step `attach` if `kpartx`
    /// fails or reports no partition.
    pub fn attach_loop(&mut self) -> Result<()> {
        self.acquire("attach", |ctx| {
            let image = ctx.image.display().to_string();
            let output = ctx.run(&CommandSpec::new("kpartx").args(["-a", "-v", image.as_str()]))?;
            let mappings = parse_kpartx_mappings(&output);

            let mut loops: Vec<PathBuf> = mappings.iter().filter_map(|m| loop_device_for(m)).collect();
            loops.dedup();
            ctx.push_loop_releases(loops, mappings.clone(), image);

            let first = mappings.first().cloned().ok_or_else(|| DiskforgeError::Config {
                message: format!("kpartx reported no partition mappings: {}", output.trim()),
            })?;
            tracing::info!(device = %first.display(), "partition mapped");
            ctx.mount_device = first;
            ctx.mappings = mappings;
            Ok(())
        })
    }

    fn push_loop_releases(&mut self, loops: Vec<PathBuf>, mappings: Vec<PathBuf>, image: String) {
        let runner = Arc::clone(&self.host.runner);
        let probe = Arc::clone(&self.host.probe);
        let log = Arc::clone(&self.log);
        self.resources.push(ResourceKind::LoopDevice, "detach loop device", move || {
            let mut result = Ok(());
            for device in loops.iter().filter(|d| probe.loop_attached(d)) {
                let losetup = CommandSpec::new("losetup").args(["-d".to_string(), device.display().to_string()]);
                if let Err(e) = runner.run(&losetup, &log, OutputMode::Captured) {
                    result = result.and(Err(e));
                }
            }
            result
        });

        let runner = Arc::clone(&self.host.runner);
        let probe = Arc::clone(&self.host.probe);
        let log = Arc::clone(&self.log);
        self.resources.push(ResourceKind::Mapping, "remove stray mapper entries", move || {
            let mut result = Ok(());
            for mapping in mappings.iter().filter(|m| probe.mapping_exists(m)) {
                let dmsetup = CommandSpec::new("dmsetup").args(["remove".to_string(), mapping.display().to_string()]);
                if let Err(e) = runner.run(&dmsetup, &log, OutputMode::Captured) {
                    result = result.and(Err(e));
                }
            }
            result
        });

        self.push_release_command(
            ResourceKind::Mapping,
            "remove partition mappings",
            CommandSpec::new("kpartx").args(["-d".to_string(), image]),
        );
    }

    /// Creates the configured filesystem, labelled `/`, on the mount
    /// device.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceAcquisition` error for step `format`.
    pub fn create_filesystem(&mut self) -> Result<()> {
        self.acquire("format", |ctx| {
            let mkfs = CommandSpec::new(format!("mkfs.{}", ctx.config.fstype)).args([
                "-F".to_string(),
                "-L".into(),
                "/".into(),
                ctx.mount_device.display().to_string(),
            ]);
            ctx.run(&mkfs).map(drop)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use diskforge_common::config::BuildConfig;
    use diskforge_core::testing::{FakeHost, FakeIsolation};

    use super::*;
    use crate::context::HostServices;

    fn context(dir: &Path, table: PartitionTable, sparse: bool) -> (Arc<FakeHost>, BuildContext) {
        let host = Arc::new(FakeHost::new());
        let services = HostServices {
            runner: host.clone(),
            probe: host.clone(),
            isolation: Arc::new(FakeIsolation::new()),
        };
        let config = BuildConfig {
            base_dir: dir.to_path_buf(),
            size_mib: 100,
            partition_table: table,
            sparse,
            ..BuildConfig::default()
        };
        (host, BuildContext::create(config, services).expect("context"))
    }

    #[test]
    fn sparse_allocation_seeks_without_writing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (host, mut ctx) = context(dir.path(), PartitionTable::Msdos, true);
        ctx.allocate_image().expect("allocate");
        let dd = &host.commands()[0];
        assert!(dd.ends_with("bs=1M seek=100 count=0"), "{dd}");
    }

    #[test]
    fn full_allocation_writes_every_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (host, mut ctx) = context(dir.path(), PartitionTable::Msdos, false);
        ctx.allocate_image().expect("allocate");
        assert!(host.commands()[0].ends_with("bs=1M count=100"));
    }

    #[test]
    fn msdos_partition_ends_on_last_sector() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (host, mut ctx) = context(dir.path(), PartitionTable::Msdos, true);
        ctx.partition_image().expect("partition");
        let commands = host.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("mklabel msdos mkpart primary 2048 204799 set 1 boot on"));
    }

    #[test]
    fn gpt_partition_reserves_tail_and_sets_legacy_boot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (host, mut ctx) = context(dir.path(), PartitionTable::Gpt, true);
        ctx.partition_image().expect("partition");
        let commands = host.commands();
        assert!(commands[0].contains("mklabel gpt mkpart primary 2048 204673"));
        assert!(commands[1].starts_with("sgdisk ") && commands[1].ends_with("--attributes=1:set:2"));
    }

    #[test]
    fn attach_switches_mount_device_to_first_mapping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_host, mut ctx) = context(dir.path(), PartitionTable::Msdos, true);
        ctx.attach_loop().expect("attach");
        assert_eq!(ctx.mount_device(), Path::new("/dev/mapper/loop0p1"));
        assert_eq!(
            ctx.resources().labels(),
            vec![
                "remove root directory",
                "detach loop device",
                "remove stray mapper entries",
                "remove partition mappings"
            ]
        );
    }

    #[test]
    fn stray_mappings_and_loops_are_removed_when_kpartx_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (host, mut ctx) = context(dir.path(), PartitionTable::Msdos, true);
        ctx.attach_loop().expect("attach");
        host.fail_on("kpartx -d");

        let report = ctx.teardown();

        assert_eq!(report.failed.len(), 1);
        let commands = host.commands();
        assert!(commands.contains(&"dmsetup remove /dev/mapper/loop0p1".to_string()));
        assert!(commands.contains(&"losetup -d /dev/loop0".to_string()));
        assert!(host.mappings().is_empty());
        assert!(host.loops().is_empty());
    }

    #[test]
    fn clean_kpartx_detach_skips_fallbacks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (host, mut ctx) = context(dir.path(), PartitionTable::Msdos, true);
        ctx.attach_loop().expect("attach");

        assert!(ctx.teardown().is_clean());
        assert!(!host.commands().iter().any(|c| c.starts_with("dmsetup") || c.starts_with("losetup")));
    }

    #[test]
    fn format_targets_mapped_partition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (host, mut ctx) = context(dir.path(), PartitionTable::Msdos, true);
        ctx.attach_loop().expect("attach");
        ctx.create_filesystem().expect("format");
        assert_eq!(host.commands().last().map(String::as_str), Some("mkfs.ext4 -F -L / /dev/mapper/loop0p1"));
    }
}
