//! SHA-256 digests used as cache keys.

use std::path::Path;

use diskforge_common::error::{DiskforgeError, Result};
use diskforge_common::types::Sha256Hash;
use sha2::{Digest, Sha256};

/// Computes the SHA-256 digest of `bytes`.
#[must_use]
pub fn digest_bytes(bytes: &[u8]) -> Sha256Hash {
    Sha256Hash::from_digest(&Sha256::digest(bytes))
}

/// Computes the SHA-256 digest of a file's contents.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<Sha256Hash> {
    tracing::debug!(path = %path.display(), "computing SHA-256 hash");
    let mut file = std::fs::File::open(path).map_err(|e| DiskforgeError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut hasher = Sha256::new();
    let _ = std::io::copy(&mut file, &mut hasher).map_err(|e| DiskforgeError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Sha256Hash::from_digest(&hasher.finalize()))
}
