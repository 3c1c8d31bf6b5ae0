//! Loop and device-mapper discovery.
//!
//! `kpartx -a -v <image>` attaches the image to a loop device and creates
//! one device-mapper entry per partition, printing a line such as
//!
//! ```text
//! add map loop0p1 (253:0): 0 202753 linear 7:0 2048
//! ```
//!
//! The mapping `/dev/mapper/loop0p1` belongs to the loop device
//! `/dev/loop0`.

use std::path::{Path, PathBuf};

/// Queries which devices still exist on the host.
pub trait DeviceProbe: Send + Sync {
    /// Returns whether the device-mapper node `mapping` still exists.
    fn mapping_exists(&self, mapping: &Path) -> bool;

    /// Returns whether the loop device `loop_device` still has a backing
    /// file attached.
    fn loop_attached(&self, loop_device: &Path) -> bool;
}

/// [`DeviceProbe`] reading `/dev` and `/sys/block`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysfsProbe;

impl DeviceProbe for SysfsProbe {
    fn mapping_exists(&self, mapping: &Path) -> bool {
        mapping.exists()
    }

    fn loop_attached(&self, loop_device: &Path) -> bool {
        loop_device.file_name().is_some_and(|name| {
            Path::new("/sys/block")
                .join(name)
                .join("loop/backing_file")
                .exists()
        })
    }
}

/// Parses the device-mapper nodes created by `kpartx -a -v`, in order.
#[must_use]
pub fn parse_kpartx_mappings(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some("add"), Some("map"), Some(name)) => {
                    Some(Path::new("/dev/mapper").join(name))
                }
                _ => None,
            }
        })
        .collect()
}

/// Returns the loop device a partition mapping belongs to
/// (`/dev/mapper/loop0p1` -> `/dev/loop0`).
#[must_use]
pub fn loop_device_for(mapping: &Path) -> Option<PathBuf> {
    let name = mapping.file_name()?.to_str()?;
    let (base, partition) = name.rsplit_once('p')?;
    let is_loop = base.strip_prefix("loop").is_some_and(|n| {
        !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())
    });
    if !is_loop || partition.is_empty() || !partition.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(Path::new("/dev").join(base))
}
