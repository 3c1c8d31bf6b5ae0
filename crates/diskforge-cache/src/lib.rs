//! # diskforge-cache
//!
//! Content-addressable artifact cache for image builds.
//!
//! An expensive artifact (for example, a package-resolution result) is
//! stored under the SHA-256 digest of the input that produced it. A later
//! build with byte-identical input primes its target from the cache
//! instead of recomputing it.
//!
//! - **Hashing**: SHA-256 digests of byte blobs and files.
//! - **Store**: the [`store::ArtifactCache`] prime/store pair.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod hash;
pub mod store;

pub use store::ArtifactCache;
