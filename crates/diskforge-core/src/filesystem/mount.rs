//! Mount descriptions for the image root.
//!
//! Mounting is done by the host's `mount` and `umount` tools; a
//! [`MountSpec`] knows how to describe itself as either command.

use std::path::{Path, PathBuf};

use crate::command::CommandSpec;

/// One mount: what goes where, with which type and options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Device or pseudo-filesystem source name.
    pub device: String,
    /// Absolute mountpoint path.
    pub mountpoint: PathBuf,
    /// Filesystem type passed to `mount -t`.
    pub fstype: String,
    /// Mount options passed to `mount -o`, if any.
    pub options: Option<String>,
}

impl MountSpec {
    /// Describes a mount without options.
    #[must_use]
    pub fn new(device: impl Into<String>, mountpoint: impl Into<PathBuf>, fstype: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            mountpoint: mountpoint.into(),
            fstype: fstype.into(),
            options: None,
        }
    }

    /// Adds mount options.
    #[must_use]
    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    /// Describes a tmpfs mounted at `mountpoint`.
    #[must_use]
    pub fn tmpfs(mountpoint: impl Into<PathBuf>) -> Self {
        Self::new("tmpfs", mountpoint, "tmpfs")
    }

    /// Returns the `mount` invocation establishing this mount.
    #[must_use]
    pub fn mount_command(&self) -> CommandSpec {
        let mut cmd = CommandSpec::new("mount").args([self.device.as_str(), "-t", self.fstype.as_str()]);
        if let Some(options) = &self.options {
            cmd = cmd.args(["-o", options.as_str()]);
        }
        cmd.arg(self.mountpoint.display().to_string())
    }

    /// Returns the `umount` invocation releasing this mount.
    #[must_use]
    pub fn unmount_command(&self) -> CommandSpec {
        CommandSpec::new("umount").arg(self.mountpoint.display().to_string())
    }
}

/// Pseudo-filesystems a package installer and its scripts expect inside
/// the image root, in mount order.
#[must_use]
pub fn pseudo_filesystems(root: &Path) -> Vec<MountSpec> {
    vec![
        MountSpec::new("proc", root.join("proc"), "proc"),
        MountSpec::new("devpts", root.join("dev/pts"), "devpts").with_options("gid=5,mode=620"),
        MountSpec::new("sys", root.join("sys"), "sysfs"),
        MountSpec::tmpfs(root.join("dev/shm")),
        MountSpec::tmpfs(root.join("tmp")),
        MountSpec::tmpfs(root.join("var/tmp")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_command_includes_type_and_options() {
        let spec = MountSpec::new("/dev/mapper/loop0p1", "/var/tmp/mkd.x", "ext4")
            .with_options("barrier=0,data=writeback");
        assert_eq!(
            spec.mount_command().to_string(),
            "mount /dev/mapper/loop0p1 -t ext4 -o barrier=0,data=writeback /var/tmp/mkd.x"
        );
    }

    #[test]
    fn unmount_command_targets_mountpoint() {
        let spec = MountSpec::tmpfs("/var/tmp/mkd.x/tmp");
        assert_eq!(spec.unmount_command().to_string(), "umount /var/tmp/mkd.x/tmp");
    }

    #[test]
    fn pseudo_filesystems_live_under_root() {
        let root = Path::new("/var/tmp/mkd.x");
        let mounts = pseudo_filesystems(root);
        assert_eq!(mounts.len(), 6);
        assert!(mounts.iter().all(|m| m.mountpoint.starts_with(root)));
        assert_eq!(mounts[0].fstype, "proc");
        assert_eq!(mounts[1].options.as_deref(), Some("gid=5,mode=620"));
    }
}
