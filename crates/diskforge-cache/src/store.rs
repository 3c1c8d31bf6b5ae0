//! The prime/store pair over a directory of digest-named files.
//!
//! ```text
//! <cache_dir>/
//!   3f1a...e9   copy of a target produced from input with that digest
//!   8c02...41
//! ```
//!
//! Entries are write-once: a second `store` for the same digest leaves the
//! first copy in place, and no entry is ever evicted.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use diskforge_common::error::{DiskforgeError, Result};
use diskforge_common::types::Sha256Hash;

use crate::hash::digest_bytes;

/// Cache binding one generating input to one target file.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
    target: PathBuf,
    digest: Sha256Hash,
}

impl ArtifactCache {
    /// Binds `target` to the cache entry for `input` inside `dir`.
    ///
    /// Nothing is touched on disk until [`prime`](Self::prime) or
    /// [`store`](Self::store) is called.
    pub fn new(dir: impl Into<PathBuf>, input: &[u8], target: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            target: target.into(),
            digest: digest_bytes(input),
        }
    }

    /// Digest of the generating input.
    #[must_use]
    pub const fn digest(&self) -> &Sha256Hash {
        &self.digest
    }

    /// Path of the cache entry for this input.
    #[must_use]
    pub fn entry_path(&self) -> PathBuf {
        self.dir.join(self.digest.as_hex())
    }

    /// Path the entry is primed into and stored from.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Copies the cached entry to the target, creating the target's parent
    /// directories. Returns whether an entry was found.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing entry cannot be copied.
    pub fn prime(&self) -> Result<bool> {
        let entry = self.entry_path();
        if !entry.is_file() {
            tracing::debug!(digest = %self.digest, "cache miss");
            return Ok(false);
        }
        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent).map_err(|e| DiskforgeError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let _ = fs::copy(&entry, &self.target).map_err(|e| DiskforgeError::Io {
            path: self.target.clone(),
            source: e,
        })?;
        tracing::info!(digest = %self.digest, target = %self.target.display(), "cache primed");
        Ok(true)
    }

    /// Copies the target into the cache unless an entry already exists.
    /// Returns whether a new entry was written.
    ///
    /// The copy is staged in the cache directory and linked into place
    /// without replacing anything, so a concurrent store of the same digest
    /// cannot clobber a completed entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be read or the cache directory
    /// cannot be written.
    pub fn store(&self) -> Result<bool> {
        let entry = self.entry_path();
        if entry.exists() {
            tracing::debug!(digest = %self.digest, "cache entry already present");
            return Ok(false);
        }
        fs::create_dir_all(&self.dir).map_err(|e| DiskforgeError::Io {
            path: self.dir.clone(),
            source: e,
        })?;

        let staged = tempfile::Builder::new()
            .prefix(".staging.")
            .tempfile_in(&self.dir)
            .map_err(|e| DiskforgeError::Io {
                path: self.dir.clone(),
                source: e,
            })?;
        let _ = fs::copy(&self.target, staged.path()).map_err(|e| DiskforgeError::Io {
            path: self.target.clone(),
            source: e,
        })?;

        match staged.persist_noclobber(&entry) {
            Ok(_) => {
                tracing::info!(digest = %self.digest, entry = %entry.display(), "cache entry stored");
                Ok(true)
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(DiskforgeError::Io {
                path: entry,
                source: e.error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().expect("tempdir"),
            }
        }

        fn cache_dir(&self) -> PathBuf {
            self.dir.path().join("cache")
        }

        fn target(&self, root: &str) -> PathBuf {
            self.dir.path().join(root).join("var/lib/pkgdb/modelcache")
        }

        fn cache(&self, input: &[u8], root: &str) -> ArtifactCache {
            ArtifactCache::new(self.cache_dir(), input, self.target(root))
        }

        fn write_target(&self, root: &str, bytes: &[u8]) {
            let target = self.target(root);
            fs::create_dir_all(target.parent().unwrap()).expect("mkdir");
            fs::write(target, bytes).expect("write target");
        }
    }

    #[test]
    fn prime_without_entry_is_noop() {
        let fx = Fixture::new();
        let cache = fx.cache(b"install group-core\n", "root");

        assert!(!cache.prime().expect("prime"));
        assert!(!cache.target().exists());
        assert!(!fx.cache_dir().exists());
    }

    #[test]
    fn store_then_prime_round_trips_into_fresh_root() {
        let fx = Fixture::new();
        fx.write_target("first", b"resolved: 412 troves");
        assert!(fx.cache(b"model", "first").store().expect("store"));

        let second = fx.cache(b"model", "second");
        assert!(second.prime().expect("prime"));
        assert_eq!(fs::read(second.target()).expect("read"), b"resolved: 412 troves");
    }

    #[test]
    fn entry_is_named_by_hex_digest() {
        let fx = Fixture::new();
        fx.write_target("root", b"x");
        let cache = fx.cache(b"", "root");
        let _ = cache.store().expect("store");
        assert!(
            fx.cache_dir()
                .join("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
                .is_file()
        );
    }

    #[test]
    fn second_store_never_overwrites() {
        let fx = Fixture::new();
        fx.write_target("root", b"original");
        let cache = fx.cache(b"model", "root");
        assert!(cache.store().expect("first store"));

        fx.write_target("root", b"changed");
        assert!(!cache.store().expect("second store"));

        assert_eq!(fs::read(cache.entry_path()).expect("read"), b"original");
    }

    #[test]
    fn one_byte_difference_gives_separate_entries() {
        let fx = Fixture::new();
        let a = fx.cache(b"install group-core\n", "a");
        let b = fx.cache(b"install group-corf\n", "b");
        assert_ne!(a.digest(), b.digest());

        fx.write_target("a", b"result a");
        let _ = a.store().expect("store a");
        assert!(!b.prime().expect("prime b"));

        fx.write_target("b", b"result b");
        let _ = b.store().expect("store b");
        assert_eq!(fs::read(a.entry_path()).expect("a"), b"result a");
        assert_eq!(fs::read(b.entry_path()).expect("b"), b"result b");
    }

    #[test]
    fn store_without_target_is_io_error() {
        let fx = Fixture::new();
        let cache = fx.cache(b"model", "missing");
        assert!(matches!(cache.store(), Err(DiskforgeError::Io { .. })));
        assert!(!cache.entry_path().exists());
    }

    #[test]
    fn store_leaves_no_staging_files() {
        let fx = Fixture::new();
        fx.write_target("root", b"data");
        let _ = fx.cache(b"model", "root").store().expect("store");
        let names: Vec<_> = fs::read_dir(fx.cache_dir())
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }
}
