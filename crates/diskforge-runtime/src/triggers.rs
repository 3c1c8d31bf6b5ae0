//! Post-install trigger scripts, run contained.
//!
//! The installer leaves a shell script of deferred trigger actions in the
//! image. Before it runs, `ldconfig` is hoisted to the top, and sections
//! that only make sense on a booted system (kernel, bootloader and udev
//! updates) are cut out. Each such section runs from its tag line through
//! the next line reading exactly `EOF`.
//!
//! The script runs inside a fresh PID namespace so daemons it starts
//! cannot outlive it and keep the image filesystem busy.

use std::fs;

use diskforge_common::error::{DiskforgeError, Result};
use diskforge_core::command::CommandSpec;

use crate::context::BuildContext;

const LDCONFIG: &str = "/sbin/ldconfig";
const SECTION_END: &str = "EOF";

/// Rewrites a trigger script: one `/sbin/ldconfig` first, and no section
/// whose first line starts with one of `skip_prefixes`.
#[must_use]
pub fn prepare_trigger_script(script: &str, skip_prefixes: &[String]) -> String {
    let mut out = vec![LDCONFIG];
    let mut skipping = false;
    for line in script.lines().filter(|line| *line != LDCONFIG) {
        if skip_prefixes.iter().any(|p| line.starts_with(p.as_str())) {
            skipping = true;
        }
        if skipping {
            if line == SECTION_END {
                skipping = false;
            }
        } else {
            out.push(line);
        }
    }
    let mut text = out.join("\n");
    text.push('\n');
    text
}

impl BuildContext {
    /// Rewrites the configured trigger script in place and runs it with
    /// `chroot <root> sh <script>` as PID 1 of a new PID namespace.
    ///
    /// Does nothing when no trigger script is configured.
    ///
    /// # Errors
    ///
    /// Returns `MissingArtifact` if the script does not exist, or the
    /// launch or supervision failure.
    pub fn run_trigger_script(&self) -> Result<()> {
        let Some(relative) = self.config.trigger_script.as_deref() else {
            return Ok(());
        };
        let path = self.root_path(relative)?;
        if !path.is_file() {
            return Err(DiskforgeError::MissingArtifact {
                kind: "trigger script",
                path,
            });
        }

        let script = fs::read_to_string(&path).map_err(|e| DiskforgeError::Io {
            path: path.clone(),
            source: e,
        })?;
        let prepared = prepare_trigger_script(&script, &self.config.skip_trigger_sections);
        fs::write(&path, prepared).map_err(|e| DiskforgeError::Io {
            path: path.clone(),
            source: e,
        })?;

        let root = self.root_dir()?.display().to_string();
        let in_root = std::path::Path::new("/").join(relative);
        let command = CommandSpec::new("chroot").args([root, "sh".to_string(), in_root.display().to_string()]);
        tracing::info!(%command, "running trigger script contained");
        self.run_contained(&command)
    }
}
