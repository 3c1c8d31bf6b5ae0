//! Forward steps of the image build.
//!
//! The `mkd.*` root directory is registered when the context is created.
//! Acquisitions then run in this order, each registering its release only
//! after its command succeeded:
//!
//! 1. allocate the backing image (nothing to release)
//! 2. partition it (nothing to release)
//! 3. attach loop and partition mappings
//! 4. create the filesystem (nothing to release)
//! 5. mount it on the root directory
//! 6. mount pseudo-filesystems under the root
//! 7. mount tmpfs over the package database
//!
//! Population and finishing steps operate on the mounted root and release
//! the top of the stack early where the build is done with it.

mod disk;
mod finish;
mod mounts;
mod skeleton;
