//! Payload installation: tarballs and the package installer.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use diskforge_cache::ArtifactCache;
use diskforge_common::constants::MODEL_CACHE_FILE;
use diskforge_common::error::{DiskforgeError, Result};
use diskforge_core::command::{CommandSpec, OutputMode};

use crate::context::BuildContext;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Splits a `prefix:path` tarball spec. Without a colon the prefix is `/`.
#[must_use]
pub fn split_tarball_spec(spec: &str) -> (&str, &str) {
    spec.split_once(':').unwrap_or(("/", spec))
}

/// Unpacks a plain or gzip-compressed tar archive into `target`.
///
/// Compression is detected from the archive's first bytes.
///
/// # Errors
///
/// Returns an error if the archive cannot be read or unpacked.
pub fn unpack_archive(archive_path: &Path, target: &Path) -> Result<()> {
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| DiskforgeError::Io { path, source }
    };

    let mut file = File::open(archive_path).map_err(io_error(archive_path))?;
    let mut magic = [0u8; 2];
    let compressed = file.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC;
    let _ = file.seek(SeekFrom::Start(0)).map_err(io_error(archive_path))?;

    let reader: Box<dyn Read> = if compressed {
        Box::new(flate2::read::GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(target).map_err(io_error(target))
}

/// Substitutes `{root}` in every argument of the install command.
fn install_argv(template: &[String], root: &Path) -> Vec<String> {
    let root = root.display().to_string();
    template.iter().map(|arg| arg.replace("{root}", &root)).collect()
}

impl BuildContext {
    /// Unpacks `archive` under `prefix` inside the image root, creating the
    /// prefix directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root is not mounted or the archive cannot be
    /// unpacked.
    pub fn install_tarball(&self, prefix: &str, archive: &Path) -> Result<()> {
        let target = self.root_path(prefix)?;
        if !target.exists() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(&target)
                .map_err(|e| DiskforgeError::Io {
                    path: target.clone(),
                    source: e,
                })?;
        }
        self.log.record(format!(
            "UNPACKING \"{}\" into \"{}\"",
            archive.display(),
            target.display()
        ));
        unpack_archive(archive, &target)?;
        tracing::info!(archive = %archive.display(), target = %target.display(), "tarball installed");
        Ok(())
    }

    /// Installs a `prefix:path` or plain `path` tarball spec.
    ///
    /// # Errors
    ///
    /// See [`install_tarball`](Self::install_tarball).
    pub fn install_tarball_spec(&self, spec: &str) -> Result<()> {
        let (prefix, archive) = split_tarball_spec(spec);
        self.install_tarball(prefix, Path::new(archive))
    }

    /// Archives the image root into an `image.*.tar.gz` in the base
    /// directory and returns its path.
    ///
    /// Meant to run after [`finish_filesystem`](Self::finish_filesystem),
    /// when no pseudo-filesystem is mounted under the root.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be written.
    pub fn create_tarball(&self) -> Result<PathBuf> {
        let root = self.root_dir()?;
        let base = &self.config.base_dir;
        let (file, path) = tempfile::Builder::new()
            .prefix("image.")
            .suffix(".tar.gz")
            .tempfile_in(base)
            .and_then(|f| f.keep().map_err(|e| e.error))
            .map_err(|e| DiskforgeError::Io {
                path: base.clone(),
                source: e,
            })?;

        let archive_error = |source| DiskforgeError::Io {
            path: path.clone(),
            source,
        };
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", root).map_err(archive_error)?;
        let encoder = builder.into_inner().map_err(archive_error)?;
        let _ = encoder.finish().map_err(archive_error)?;
        tracing::info!(path = %path.display(), "image root archived");
        Ok(path)
    }

    /// Runs the configured install command against the image root.
    ///
    /// With a cache directory and a system model, the installer's
    /// resolution cache is primed from earlier builds of the same model
    /// before the run and stored after it.
    ///
    /// # Errors
    ///
    /// Returns `Config` if no install command is configured, or the
    /// installer's or the cache's failure.
    pub fn install_system(&self) -> Result<()> {
        let root = self.root_dir()?;
        let argv = install_argv(&self.config.install_command, root);
        let command = CommandSpec::from_argv(&argv)?;

        let cache = match (&self.config.cache_dir, &self.system_model) {
            (Some(dir), Some(model)) => Some(ArtifactCache::new(
                dir,
                model,
                self.root_path(&self.config.package_db_dir)?.join(MODEL_CACHE_FILE),
            )),
            _ => None,
        };
        if let Some(cache) = &cache {
            let _ = cache.prime()?;
        }

        let _ = self.run_mode(&command, OutputMode::Foreground)?;

        if let Some(cache) = &cache {
            if cache.target().is_file() {
                let _ = cache.store()?;
            } else {
                tracing::warn!(
                    target = %cache.target().display(),
                    "installer produced no resolution cache, nothing to store"
                );
            }
        }
        Ok(())
    }
}
