//! Filesystem and block-device helpers for image builds.
//!
//! Provides mount descriptions for the root and pseudo-filesystems,
//! loop/mapper device discovery, and the boot-sector write.

pub mod boot_sector;
pub mod loopdev;
pub mod mount;
