//! System-wide constants and default paths.

use std::time::Duration;

/// Default directory for build scratch files (image, log, root dir).
pub const DEFAULT_BASE_DIR: &str = "/var/tmp";

/// Default image size in MiB.
pub const DEFAULT_SIZE_MIB: u64 = 1024;

/// Default filesystem type for the root partition.
pub const DEFAULT_FSTYPE: &str = "ext4";

/// Default mount options for the root filesystem while it is populated.
pub const DEFAULT_MOUNT_OPTIONS: &str = "barrier=0,data=writeback";

/// Default package database directory, relative to the image root.
pub const DEFAULT_PACKAGE_DB_DIR: &str = "var/lib/pkgdb";

/// Name of the dependency-resolution cache file inside the package database.
pub const MODEL_CACHE_FILE: &str = "modelcache";

/// Root-relative path where the system model is installed.
pub const SYSTEM_MODEL_PATH: &str = "etc/system-model";

/// Bytes per disk sector.
pub const SECTOR_SIZE: u64 = 512;

/// Sectors per MiB.
pub const SECTORS_PER_MIB: u64 = 1024 * 1024 / SECTOR_SIZE;

/// First sector of the root partition (reserves 1 MiB, the fdisk default).
pub const FIRST_PARTITION_SECTOR: u64 = 2048;

/// Sectors left free at the end of a GPT disk for the backup header and
/// table, rounded up to a full 64 KiB stride.
pub const GPT_TAIL_RESERVED_SECTORS: u64 = 127;

/// Length of the boot code area at the start of an MBR.
pub const BOOT_SECTOR_LEN: usize = 440;

/// Grace period between SIGTERM and SIGKILL when clearing a PID namespace.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Number of diagnostic log lines attached to surfaced errors.
pub const DEFAULT_LOG_TAIL_LINES: usize = 10;

/// PID a process must observe for itself inside a fresh PID namespace.
pub const NAMESPACE_INIT_PID: i32 = 1;

/// Exit code of a contained init that refused to run its command.
pub const LAUNCH_REFUSED_EXIT_CODE: i32 = 125;

/// Stack size handed to `clone(2)` for the contained init.
pub const CLONE_STACK_SIZE: usize = 1024 * 1024;

/// Host tools the build pipeline shells out to.
pub const REQUIRED_TOOLS: &[&str] = &[
    "dd", "parted", "kpartx", "dmsetup", "losetup", "mount", "umount", "chroot",
];

/// Trigger-script sections that are skipped during image builds.
pub const DEFAULT_SKIP_TRIGGER_SECTIONS: &[&str] = &[
    "/usr/libexec/conary/tags/kernel files update ",
    "/usr/libexec/conary/tags/extlinux files update ",
    "/usr/libexec/conary/tags/udev files update ",
];
