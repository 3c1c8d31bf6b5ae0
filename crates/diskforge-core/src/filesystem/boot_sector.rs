//! Boot code written to the first bytes of the image.
//!
//! The payload fills the MBR boot code area exactly. The partition table
//! that follows it must survive, so the image is never truncated and the
//! write is never split or padded.

use std::io::Write;
use std::path::Path;

use diskforge_common::constants::BOOT_SECTOR_LEN;
use diskforge_common::error::{DiskforgeError, Result};

/// Writes `payload` through `out` with a single write call.
///
/// `target` only labels errors.
///
/// # Errors
///
/// - `DiskforgeError::ShortWrite` if the payload is shorter than the boot
///   code area, or if the write accepted fewer bytes than the payload.
/// - `DiskforgeError::Config` if the payload would overlap the partition
///   table.
/// - `DiskforgeError::Io` if the write fails outright.
pub fn write_boot_sector<W: Write>(out: &mut W, target: &Path, payload: &[u8]) -> Result<()> {
    if payload.len() < BOOT_SECTOR_LEN {
        return Err(DiskforgeError::ShortWrite {
            path: target.to_path_buf(),
            written: payload.len(),
            expected: BOOT_SECTOR_LEN,
        });
    }
    if payload.len() > BOOT_SECTOR_LEN {
        return Err(DiskforgeError::Config {
            message: format!(
                "boot sector payload is {} bytes, larger than the {BOOT_SECTOR_LEN}-byte boot code area",
                payload.len()
            ),
        });
    }

    let written = out.write(payload).map_err(|e| DiskforgeError::Io {
        path: target.to_path_buf(),
        source: e,
    })?;
    if written != payload.len() {
        return Err(DiskforgeError::ShortWrite {
            path: target.to_path_buf(),
            written,
            expected: payload.len(),
        });
    }
    out.flush().map_err(|e| DiskforgeError::Io {
        path: target.to_path_buf(),
        source: e,
    })
}

/// Writes `payload` at offset 0 of the image file without truncating it.
///
/// # Errors
///
/// Returns an error if the image cannot be opened or the write is short.
pub fn install_boot_sector(image: &Path, payload: &[u8]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(image)
        .map_err(|e| DiskforgeError::Io {
            path: image.to_path_buf(),
            source: e,
        })?;
    write_boot_sector(&mut file, image, payload)?;
    tracing::info!(image = %image.display(), bytes = payload.len(), "boot sector written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `limit` bytes per write call.
    struct Stingy {
        limit: usize,
        accepted: Vec<u8>,
    }

    impl Write for Stingy {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.limit);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn short_payload_is_rejected_before_writing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("disk.img");
        std::fs::write(&image, vec![0xAAu8; 4096]).expect("image");

        let err = install_boot_sector(&image, &[0x33; 300]).unwrap_err();

        assert!(matches!(
            err,
            DiskforgeError::ShortWrite { written: 300, expected: 440, .. }
        ));
        let bytes = std::fs::read(&image).expect("read");
        assert_eq!(bytes.len(), 4096);
        assert!(bytes.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn partial_write_is_short_write() {
        let mut out = Stingy { limit: 200, accepted: Vec::new() };
        let err = write_boot_sector(&mut out, Path::new("disk.img"), &[0x11; 440]).unwrap_err();
        assert!(matches!(
            err,
            DiskforgeError::ShortWrite { written: 200, expected: 440, .. }
        ));
    }

    #[test]
    fn oversized_payload_is_config_error() {
        let mut out = Vec::new();
        let err = write_boot_sector(&mut out, Path::new("disk.img"), &[0; 512]).unwrap_err();
        assert!(matches!(err, DiskforgeError::Config { .. }));
        assert!(out.is_empty());
    }

    #[test]
    fn full_payload_overwrites_only_boot_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("disk.img");
        std::fs::write(&image, vec![0xAAu8; 4096]).expect("image");

        install_boot_sector(&image, &[0x55; 440]).expect("write");

        let bytes = std::fs::read(&image).expect("read");
        assert_eq!(bytes.len(), 4096);
        assert!(bytes[..440].iter().all(|&b| b == 0x55));
        assert!(bytes[440..].iter().all(|&b| b == 0xAA));
    }
}
