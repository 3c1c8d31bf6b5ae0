//! The minimal tree an installer expects under a fresh root.

use std::fs;
use std::path::Path;

use diskforge_common::constants::SYSTEM_MODEL_PATH;
use diskforge_common::error::Result;
use diskforge_core::command::CommandSpec;

use super::mounts::set_mode;
use crate::context::{BuildContext, io_error};

/// Directories created under the root, parents first, with their modes.
const DIRECTORIES: &[(&str, u32)] = &[
    ("dev", 0o755),
    ("dev/shm", 0o1777),
    ("dev/pts", 0o755),
    ("tmp", 0o1777),
    ("etc", 0o755),
    ("etc/sysconfig", 0o755),
    ("proc", 0o755),
    ("sys", 0o755),
    ("var", 0o755),
    ("var/tmp", 0o1777),
    ("var/lib", 0o755),
];

/// Character devices: name, mode, major, minor.
const DEVICE_NODES: &[(&str, &str, u32, u32)] = &[
    ("null", "0666", 1, 3),
    ("zero", "0666", 1, 5),
    ("full", "0666", 1, 7),
    ("random", "0666", 1, 8),
    ("urandom", "0666", 1, 9),
    ("console", "0600", 5, 1),
];

fn fstab(fstype: &str) -> String {
    format!(
        "LABEL=/            /           {fstype:<8}defaults        1 1\n\
         tmpfs              /tmp        tmpfs   defaults        0 0\n\
         tmpfs              /dev/shm    tmpfs   defaults        0 0\n\
         devpts             /dev/pts    devpts  gid=5,mode=620  0 0\n\
         sysfs              /sys        sysfs   defaults        0 0\n\
         proc               /proc       proc    defaults        0 0\n"
    )
}

impl BuildContext {
    /// Creates the directory tree, device nodes, `fstab` and `mtab`, and
    /// installs the system model when one is given.
    ///
    /// The model's bytes are kept as the key of the resolution cache.
    ///
    /// # Errors
    ///
    /// Returns an error if any file, directory or node cannot be created,
    /// or the model cannot be read.
    pub fn populate_skeleton(&mut self, model: Option<&Path>) -> Result<()> {
        self.create_directory_tree()?;
        self.create_device_nodes()?;

        let etc = self.root_path("etc")?;
        let fstab_path = etc.join("fstab");
        fs::write(&fstab_path, fstab(&self.config.fstype)).map_err(io_error(&fstab_path))?;
        let mtab = etc.join("mtab");
        fs::write(&mtab, "").map_err(io_error(&mtab))?;

        if let Some(model) = model {
            let bytes = fs::read(model).map_err(io_error(model))?;
            let target = self.root_path(SYSTEM_MODEL_PATH)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            fs::write(&target, &bytes).map_err(io_error(&target))?;
            tracing::info!(model = %model.display(), "system model installed");
            self.system_model = Some(bytes);
        }
        Ok(())
    }

    /// Creates the skeleton directories and the package database
    /// directory with their final modes.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn create_directory_tree(&self) -> Result<()> {
        for (relative, mode) in DIRECTORIES {
            let dir = self.root_path(relative)?;
            fs::create_dir_all(&dir).map_err(io_error(&dir))?;
            set_mode(&dir, *mode)?;
        }
        let db = self.root_path(&self.config.package_db_dir)?;
        fs::create_dir_all(&db).map_err(io_error(&db))?;
        Ok(())
    }

    /// Creates the character devices every chroot needs with `mknod`.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` if a node cannot be created.
    pub fn create_device_nodes(&self) -> Result<()> {
        let dev = self.root_path("dev")?;
        for (name, mode, major, minor) in DEVICE_NODES {
            let mknod = CommandSpec::new("mknod").args([
                "-m".to_string(),
                (*mode).to_string(),
                dev.join(name).display().to_string(),
                "c".to_string(),
                major.to_string(),
                minor.to_string(),
            ]);
            let _ = self.run(&mknod)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fstab_names_root_filesystem_type() {
        let table = fstab("xfs");
        let first = table.lines().next().unwrap();
        assert!(first.starts_with("LABEL=/"));
        assert!(first.contains(" xfs "));
        assert_eq!(table.lines().count(), 6);
    }

    #[test]
    fn directories_list_parents_first() {
        for (index, (relative, _)) in DIRECTORIES.iter().enumerate() {
            if let Some((parent, _)) = relative.rsplit_once('/') {
                assert!(
                    DIRECTORIES[..index].iter().any(|(d, _)| *d == parent),
                    "{relative} listed before {parent}"
                );
            }
        }
    }
}
