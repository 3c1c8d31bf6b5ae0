//! `diskforge digest`: print the cache key of a system model.

use std::path::PathBuf;

use clap::Args;
use diskforge_cache::hash::hash_file;

use crate::output;

/// Arguments for the `digest` command.
#[derive(Args, Debug)]
pub struct DigestArgs {
    /// System model file.
    pub file: PathBuf,

    /// Also report whether this cache directory holds an entry for it.
    #[arg(long, env = "DISKFORGE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,
}

/// Executes the `digest` command.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn execute(args: &DigestArgs) -> anyhow::Result<()> {
    let digest = hash_file(&args.file)?;
    let cached = args
        .cache_dir
        .as_ref()
        .map(|dir| dir.join(digest.as_hex()).is_file());
    output::print_digest(digest.as_hex(), cached);
    Ok(())
}
