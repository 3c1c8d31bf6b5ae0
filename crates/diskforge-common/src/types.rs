//! Domain primitive types used across the diskforge workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{FIRST_PARTITION_SECTOR, GPT_TAIL_RESERVED_SECTORS, SECTORS_PER_MIB};
use crate::error::{DiskforgeError, Result};

/// Unique identifier for one image build session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildId(String);

impl BuildId {
    /// Generates a random build ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partition table layout written to the image.
///
/// The serialized names are the labels `parted mklabel` understands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTable {
    /// Classic MBR partition table.
    #[default]
    Msdos,
    /// GUID partition table.
    Gpt,
}

impl PartitionTable {
    /// Returns the `parted` label name.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Msdos => "msdos",
            Self::Gpt => "gpt",
        }
    }

    /// Returns the first and last sector of the single root partition on a
    /// disk of `size_mib` MiB.
    ///
    /// # Errors
    ///
    /// Returns `DiskforgeError::Config` if the sector count overflows or the
    /// disk is too small to hold a partition after the first sector.
    pub fn partition_bounds(self, size_mib: u64) -> Result<(u64, u64)> {
        let last = size_mib.checked_mul(SECTORS_PER_MIB).and_then(|sectors| match self {
            Self::Msdos => sectors.checked_sub(1),
            Self::Gpt => sectors.checked_sub(GPT_TAIL_RESERVED_SECTORS),
        });
        match last {
            Some(last) if last > FIRST_PARTITION_SECTOR => Ok((FIRST_PARTITION_SECTOR, last)),
            _ => Err(DiskforgeError::Config {
                message: format!("a {size_mib} MiB disk cannot hold a {} partition", self.label()),
            }),
        }
    }

    /// Returns the file name of the syslinux boot code for this layout.
    #[must_use]
    pub const fn boot_code_file(self) -> &'static str {
        match self {
            Self::Msdos => "mbr.bin",
            Self::Gpt => "gptmbr.bin",
        }
    }
}

impl fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// SHA-256 digest used as a content-addressed cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha256Hash(String);

impl Sha256Hash {
    /// Hex-encodes a raw digest.
    #[must_use]
    pub fn from_digest(digest: &[u8]) -> Self {
        use std::fmt::Write;

        let hex = digest
            .iter()
            .fold(String::with_capacity(digest.len() * 2), |mut hex, byte| {
                let _ = write!(hex, "{byte:02x}");
                hex
            });
        Self(hex)
    }

    /// Returns the hex-encoded hash string.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msdos_partition_spans_to_last_sector() {
        let (first, last) = PartitionTable::Msdos.partition_bounds(100).unwrap();
        assert_eq!(first, 2048);
        assert_eq!(last, 100 * 2048 - 1);
    }

    #[test]
    fn gpt_partition_leaves_room_for_backup_table() {
        let (_, last) = PartitionTable::Gpt.partition_bounds(100).unwrap();
        assert_eq!(last, 100 * 2048 - 127);
    }

    #[test]
    fn oversized_disk_has_no_partition_bounds() {
        let err = PartitionTable::Msdos.partition_bounds(u64::MAX / 1024).unwrap_err();
        assert!(matches!(err, DiskforgeError::Config { .. }));
    }

    #[test]
    fn one_mib_disk_is_too_small_for_a_partition() {
        assert!(PartitionTable::Msdos.partition_bounds(1).is_err());
        assert!(PartitionTable::Gpt.partition_bounds(1).is_err());
        assert!(PartitionTable::Msdos.partition_bounds(2).is_ok());
    }

    #[test]
    fn partition_table_serializes_as_parted_label() {
        let json = serde_json::to_string(&PartitionTable::Gpt).unwrap();
        assert_eq!(json, "\"gpt\"");
    }

    #[test]
    fn sha256_hex_is_lowercase_and_zero_padded() {
        let hash = Sha256Hash::from_digest(&[0x0a, 0xff]);
        assert_eq!(hash.as_hex(), "0aff");
    }

    #[test]
    fn sha256_display_has_algorithm_prefix() {
        let hash = Sha256Hash::from_digest(&[0xaa; 32]);
        assert_eq!(hash.to_string(), format!("sha256:{}", "a".repeat(64)));
    }

    #[test]
    fn build_ids_are_unique() {
        assert_ne!(BuildId::generate(), BuildId::generate());
    }
}
