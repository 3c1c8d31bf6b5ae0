//! System configuration written into the finished root.

use std::fs;
use std::path::Path;

use diskforge_common::error::{DiskforgeError, Result};
use diskforge_core::command::{CommandSpec, OutputMode};

use crate::context::{BuildContext, io_error};

/// Contents of the `etc/sysconfig` files, keyed by root-relative path.
fn sysconfig_files(timezone: &str, lang: &str, keytable: &str) -> Vec<(&'static str, String)> {
    vec![
        ("etc/sysconfig/clock", format!("ZONE=\"{timezone}\"\nUTC=true\n")),
        (
            "etc/sysconfig/i18n",
            format!("LANG=\"{lang}\"\nSYSFONT=\"latarcyrheb-sun16\"\n"),
        ),
        (
            "etc/sysconfig/keyboard",
            format!("KEYBOARDTYPE=\"pc\"\nKEYTABLE=\"{keytable}\"\n"),
        ),
        (
            "etc/sysconfig/mouse",
            "MOUSETYPE=\"imps2\"\n\
             XEMU3=\"no\" # yes = emulate 3 buttons\n\
             XMOUSETYPE=\"imps2\"\n\
             # Common mouse types:\n\
             # imps2 -- A generic USB wheel mouse\n\
             # microsoft -- A microsoft mouse\n\
             # logitech -- A logitech mouse\n\
             # ps/2 -- Legacy PS/2 mouse\n"
                .to_string(),
        ),
    ]
}

/// Replaces the `initdefault` entry of an inittab.
fn rewrite_initdefault(inittab: &str, level: u8) -> String {
    inittab
        .lines()
        .map(|line| {
            if line.starts_with("id:") && line.contains("initdefault") {
                format!("id:{level}:initdefault:\n")
            } else {
                format!("{line}\n")
            }
        })
        .collect()
}

fn bootloader_conf(kernel: &str) -> String {
    format!(
        "read_only\n\
         timeout 50\n\
         default {kernel}\n\
         include '/etc/bootloader.d/*'\n\
         linux {kernel} 'Linux {kernel}' /boot/vmlinuz-{kernel} /boot/initrd-{kernel}\n"
    )
}

impl BuildContext {
    /// Writes clock, locale, keyboard and mouse settings the image does not
    /// already carry, and installs the time zone as `etc/localtime`.
    ///
    /// # Errors
    ///
    /// Returns `MissingArtifact` if the image has no zoneinfo file for the
    /// time zone.
    pub fn write_post_config(&self, timezone: &str, lang: &str, keytable: &str) -> Result<()> {
        for (relative, contents) in sysconfig_files(timezone, lang, keytable) {
            let path = self.root_path(relative)?;
            if path.exists() {
                tracing::debug!(path = %path.display(), "keeping existing configuration");
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            fs::write(&path, contents).map_err(io_error(&path))?;
        }

        let zone = self.root_path(Path::new("usr/share/zoneinfo").join(timezone))?;
        if !zone.is_file() {
            return Err(DiskforgeError::MissingArtifact {
                kind: "zoneinfo file",
                path: zone,
            });
        }
        let localtime = self.root_path("etc/localtime")?;
        let _ = fs::copy(&zone, &localtime).map_err(io_error(&localtime))?;
        Ok(())
    }

    /// Sets the default runlevel in `etc/inittab`.
    ///
    /// # Errors
    ///
    /// Returns `MissingArtifact` if the image has no inittab.
    pub fn set_initlevel(&self, level: u8) -> Result<()> {
        let inittab = self.root_path("etc/inittab")?;
        if !inittab.is_file() {
            return Err(DiskforgeError::MissingArtifact {
                kind: "inittab",
                path: inittab,
            });
        }
        let current = fs::read_to_string(&inittab).map_err(io_error(&inittab))?;
        fs::write(&inittab, rewrite_initdefault(&current, level)).map_err(io_error(&inittab))
    }

    /// Returns the installed kernel version: the first entry of
    /// `lib/modules`, in name order. Remembered for the initrd.
    ///
    /// # Errors
    ///
    /// Returns `MissingArtifact` if no kernel modules are installed.
    pub fn kernel_version(&mut self) -> Result<String> {
        if let Some(version) = &self.kernel_version {
            return Ok(version.clone());
        }
        let modules = self.root_path("lib/modules")?;
        let mut versions: Vec<String> = fs::read_dir(&modules)
            .map(|entries| {
                entries
                    .filter_map(std::result::Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        versions.sort();
        let version = versions.into_iter().next().ok_or_else(|| DiskforgeError::MissingArtifact {
            kind: "kernel modules",
            path: modules,
        })?;
        self.kernel_version = Some(version.clone());
        Ok(version)
    }

    /// Writes `etc/bootloader.conf` for the installed kernel.
    ///
    /// # Errors
    ///
    /// Returns `MissingArtifact` if no kernel is installed.
    pub fn create_bootloader_conf(&mut self) -> Result<()> {
        let kernel = self.kernel_version()?;
        let path = self.root_path("etc/bootloader.conf")?;
        fs::write(&path, bootloader_conf(&kernel)).map_err(io_error(&path))
    }

    /// Writes a default `etc/bootloader.d/root.conf` if absent and runs
    /// `bootman` in the root. A GRUB configuration without `menu.lst` gets
    /// one that boots from the first disk with a short timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written or `bootman` fails.
    pub fn run_bootman(&self) -> Result<()> {
        let conf_dir = self.root_path("etc/bootloader.d")?;
        fs::create_dir_all(&conf_dir).map_err(io_error(&conf_dir))?;
        let root_conf = conf_dir.join("root.conf");
        if !root_conf.exists() {
            fs::write(&root_conf, "timeout 50\nread_only \nroot LABEL=/\n").map_err(io_error(&root_conf))?;
        }

        let _ = self.run(&self.chroot(["bootman"]))?;

        let grub_conf = self.root_path("boot/grub/grub.conf")?;
        let menu_lst = self.root_path("boot/grub/menu.lst")?;
        if grub_conf.is_file() && !menu_lst.exists() {
            let grub = fs::read_to_string(&grub_conf).map_err(io_error(&grub_conf))?;
            let menu = grub
                .replace("    kernel", "    root (hd0)\n    kernel")
                .replace("timeout=5", "timeout=1");
            fs::write(&menu_lst, menu).map_err(io_error(&menu_lst))?;
        }
        Ok(())
    }

    /// Builds module dependencies and the initrd for the installed kernel.
    ///
    /// # Errors
    ///
    /// Returns `MissingArtifact` if no kernel is installed, or the failure
    /// of `depmod` or `dracut`.
    pub fn create_initrd(&mut self) -> Result<()> {
        let kernel = self.kernel_version()?;
        let system_map = format!("/boot/System.map-{kernel}");
        let initrd = format!("/boot/initrd-{kernel}");
        let depmod = self.chroot(["depmod", "-ae", "-F", system_map.as_str(), kernel.as_str()]);
        let _ = self.run_mode(&depmod, OutputMode::Foreground)?;
        let dracut = self.chroot(["dracut", "-f", initrd.as_str(), kernel.as_str()]);
        let _ = self.run_mode(&dracut, OutputMode::Foreground)?;
        Ok(())
    }

    /// Runs a shell command line inside the root.
    ///
    /// # Errors
    ///
    /// Returns the command's failure.
    pub fn run_post_script(&self, script: &str) -> Result<()> {
        self.run(&self.chroot(["sh", "-c", script])).map(drop)
    }

    /// Moves account passwords into the shadow file.
    ///
    /// # Errors
    ///
    /// Returns the failure of `pwconv`.
    pub fn convert_passwords(&self) -> Result<()> {
        self.run(&self.chroot(["pwconv"])).map(drop)
    }

    /// Clears the root account's password.
    ///
    /// # Errors
    ///
    /// Returns the failure of `usermod`.
    pub fn unset_root_password(&self) -> Result<()> {
        self.run(&self.chroot(["usermod", "-p", "", "root"])).map(drop)
    }

    /// Opens an interactive shell in the root so an operator can inspect a
    /// failed build. Failure to start it is only logged.
    pub fn root_shell(&self) {
        let Ok(root) = self.root_dir() else {
            tracing::warn!("no mounted root to inspect");
            return;
        };
        tracing::info!(root = %root.display(), "opening inspection shell, exit it to tear down");
        if let Err(e) = self.run_mode(&self.chroot(["sh"]), OutputMode::Interactive) {
            tracing::warn!(error = %e, "failed to invoke shell in image");
        }
    }

    /// `chroot <root> <args...>`.
    fn chroot<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> CommandSpec {
        let root = self
            .root_dir
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        CommandSpec::new("chroot").arg(root).args(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initdefault_line_is_replaced() {
        let inittab = "# default runlevel\nid:5:initdefault:\nsi::sysinit:/etc/rc.sysinit\n";
        assert_eq!(
            rewrite_initdefault(inittab, 3),
            "# default runlevel\nid:3:initdefault:\nsi::sysinit:/etc/rc.sysinit\n"
        );
    }

    #[test]
    fn inittab_without_initdefault_is_unchanged() {
        let inittab = "si::sysinit:/etc/rc.sysinit\n";
        assert_eq!(rewrite_initdefault(inittab, 3), inittab);
    }

    #[test]
    fn bootloader_conf_names_kernel_everywhere() {
        let conf = bootloader_conf("6.1.0-1");
        assert!(conf.contains("default 6.1.0-1\n"));
        assert!(conf.ends_with("/boot/vmlinuz-6.1.0-1 /boot/initrd-6.1.0-1\n"));
    }

    #[test]
    fn sysconfig_covers_clock_locale_keyboard_mouse() {
        let files = sysconfig_files("Europe/Paris", "fr_FR.UTF-8", "fr");
        assert_eq!(files.len(), 4);
        assert_eq!(files[0].1, "ZONE=\"Europe/Paris\"\nUTC=true\n");
        assert!(files[2].1.contains("KEYTABLE=\"fr\""));
    }
}
