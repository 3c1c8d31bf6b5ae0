//! Finishing the populated root: bootloader, package database, boot code.

use std::fs;
use std::os::unix::fs::DirBuilderExt;

use diskforge_common::error::{DiskforgeError, Result};
use diskforge_core::command::CommandSpec;
use diskforge_core::filesystem::boot_sector::install_boot_sector;

use crate::context::BuildContext;
use crate::resources::ResourceKind;

impl BuildContext {
    /// Installs extlinux when the image ships its boot code, moves the
    /// package database off tmpfs, unmounts the pseudo-filesystems and
    /// writes the boot code to the first bytes of the image.
    ///
    /// The root filesystem itself stays mounted for later inspection or
    /// archiving; teardown releases it.
    ///
    /// # Errors
    ///
    /// Returns an error if a command fails, an early release fails, or the
    /// boot code cannot be written in full.
    pub fn finish_filesystem(&mut self) -> Result<()> {
        let boot_dir = self.root_path("boot/extlinux")?;
        let boot_code_path = boot_dir.join(self.config.partition_table.boot_code_file());
        let boot_code = if boot_code_path.is_file() {
            let code = fs::read(&boot_code_path).map_err(|e| DiskforgeError::Io {
                path: boot_code_path.clone(),
                source: e,
            })?;
            let extlinux = CommandSpec::new("extlinux").args(["-i".to_string(), boot_dir.display().to_string()]);
            let _ = self.run(&extlinux)?;
            Some(code)
        } else {
            tracing::info!(path = %boot_code_path.display(), "no boot code in image, skipping extlinux");
            None
        };

        if self.package_db_mounted {
            self.move_package_db_off_tmpfs()?;
        }

        while let Some(released) = self.resources.release_top(ResourceKind::PseudoFilesystem) {
            released?;
        }

        if let Some(code) = boot_code {
            install_boot_sector(&self.image, &code)?;
        }
        Ok(())
    }

    /// Copies the tmpfs package database to `<db>.real`, unmounts the
    /// tmpfs and moves the copy into place.
    fn move_package_db_off_tmpfs(&mut self) -> Result<()> {
        let db = self.root_path(&self.config.package_db_dir)?;
        let mut real = db.clone().into_os_string();
        real.push(".real");
        let real = std::path::PathBuf::from(real);

        fs::DirBuilder::new()
            .mode(0o755)
            .create(&real)
            .map_err(|e| DiskforgeError::Io {
                path: real.clone(),
                source: e,
            })?;
        let entries = fs::read_dir(&db).map_err(|e| DiskforgeError::Io {
            path: db.clone(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| DiskforgeError::Io {
                path: db.clone(),
                source: e,
            })?;
            let cp = CommandSpec::new("cp").args([
                "-a".to_string(),
                entry.path().display().to_string(),
                format!("{}/", real.display()),
            ]);
            let _ = self.run(&cp)?;
        }

        if let Some(released) = self.resources.release_top(ResourceKind::PackageDb) {
            released?;
        }
        self.package_db_mounted = false;

        fs::rename(&real, &db).map_err(|e| DiskforgeError::Io {
            path: db.clone(),
            source: e,
        })?;
        tracing::info!(path = %db.display(), "package database moved onto image");
        Ok(())
    }
}
