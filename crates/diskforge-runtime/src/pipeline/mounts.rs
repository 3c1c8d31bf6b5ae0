//! Mounts on the image root.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use diskforge_common::error::{DiskforgeError, Result};
use diskforge_core::filesystem::mount::{MountSpec, pseudo_filesystems};

use crate::context::BuildContext;
use crate::resources::ResourceKind;

/// Mountpoints whose modes the mounted filesystem hides, with the mode to
/// restore on top of the mount.
const MOUNTPOINT_MODES: &[(&str, u32)] = &[
    ("dev/shm", 0o1777),
    ("dev/pts", 0o755),
    ("tmp", 0o1777),
    ("var/tmp", 0o1777),
];

pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| DiskforgeError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

impl BuildContext {
    /// Mounts the new filesystem on the context's `mkd.*` directory.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceAcquisition` error for step `mount`.
    pub fn mount_filesystem(&mut self) -> Result<()> {
        self.acquire("mount", |ctx| {
            let root = ctx.mountpoint.clone();
            let spec = MountSpec::new(
                ctx.mount_device.display().to_string(),
                root.clone(),
                ctx.config.fstype.clone(),
            )
            .with_options(ctx.config.mount_options.clone());
            let _ = ctx.run(&spec.mount_command())?;
            ctx.push_release_command(
                ResourceKind::Filesystem,
                "unmount root filesystem",
                spec.unmount_command(),
            );

            tracing::info!(root = %root.display(), "root filesystem mounted");
            ctx.root_dir = Some(root);
            Ok(())
        })
    }

    /// Mounts proc, devpts, sysfs and the tmpfs scratch directories under
    /// the root, each with its own unmount, then restores the modes the
    /// mounts hid.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceAcquisition` error for step `pseudo-filesystems`.
    pub fn mount_pseudo_filesystems(&mut self) -> Result<()> {
        self.acquire("pseudo-filesystems", |ctx| {
            let root = ctx.root_dir()?.to_path_buf();
            for spec in pseudo_filesystems(&root) {
                let _ = ctx.run(&spec.mount_command())?;
                let label = format!("unmount {}", spec.mountpoint.display());
                ctx.push_release_command(ResourceKind::PseudoFilesystem, label, spec.unmount_command());
            }
            for (relative, mode) in MOUNTPOINT_MODES {
                set_mode(&root.join(relative), *mode)?;
            }
            Ok(())
        })
    }

    /// Puts the package database directory on tmpfs, when enabled, so the
    /// installer's many small writes never wait on the image.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceAcquisition` error for step `package-db`.
    pub fn mount_package_db(&mut self) -> Result<()> {
        if !self.config.tmpfs_package_db {
            tracing::debug!("package database stays on the image filesystem");
            return Ok(());
        }
        self.acquire("package-db", |ctx| {
            let db = ctx.root_path(&ctx.config.package_db_dir)?;
            let spec = MountSpec::tmpfs(db);
            let _ = ctx.run(&spec.mount_command())?;
            ctx.push_release_command(ResourceKind::PackageDb, "unmount package database", spec.unmount_command());
            ctx.package_db_mounted = true;
            Ok(())
        })
    }
}
