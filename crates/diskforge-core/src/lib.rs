//! # diskforge-core
//!
//! Low-level Linux primitives for the diskforge image builder.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: starting a single contained process as PID 1 of a fresh
//!   PID namespace through the injectable [`namespace::Isolation`] interface.
//! - **Launch and supervision**: the contained init's kill escalation and the
//!   parent's wait-and-classify loop.
//! - **Commands**: the synchronous external-tool capability and the
//!   diagnostic log every invocation writes to.
//! - **Filesystem**: mount descriptions, loop/mapper device discovery, and
//!   boot-sector writes.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod command;
pub mod filesystem;
pub mod launcher;
pub mod log_sink;
pub mod namespace;
pub mod preflight;
pub mod supervisor;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
