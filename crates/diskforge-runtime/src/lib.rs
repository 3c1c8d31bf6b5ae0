//! Disk image build pipeline for diskforge.
//!
//! A build acquires host resources in a fixed order (image file, partition
//! table, loop and mapper devices, filesystem, mounts), populates the
//! mounted root, and releases everything in reverse order through the
//! [`resources::ResourceStack`] owned by its [`context::BuildContext`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod builder;
pub mod context;
pub mod payload;
mod pipeline;
pub mod post_config;
pub mod resources;
pub mod triggers;

pub use builder::{BuildOutcome, BuildPlan, ImageBuilder};
pub use context::{BuildContext, HostServices};
