//! Resource-guard stack.
//!
//! Every acquisition that changes host state pushes one [`ReleaseGuard`]
//! after its command succeeds. Teardown pops the guards in reverse order and
//! runs each release on its own, so one failing release never prevents the
//! next one from running.

use std::fmt;

use diskforge_common::error::{DiskforgeError, Result};

/// What a guard releases.
///
/// Used to release the top of the stack early when the build is done with a
/// group of resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// The temporary directory the root filesystem is mounted on.
    RootDir,
    /// A loop device attached to the backing image.
    LoopDevice,
    /// Device-mapper partition mappings.
    Mapping,
    /// The root filesystem mount.
    Filesystem,
    /// A pseudo-filesystem or tmpfs under the image root.
    PseudoFilesystem,
    /// The tmpfs holding the package database.
    PackageDb,
}

type ReleaseFn = Box<dyn FnMut() -> Result<()> + Send>;

/// One registered release step.
pub struct ReleaseGuard {
    kind: ResourceKind,
    label: String,
    release: ReleaseFn,
}

impl ReleaseGuard {
    /// What the guard releases.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Human-readable description of the release step.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for ReleaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseGuard")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Outcome of running a batch of release steps.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Labels of every step, in the order they ran.
    pub ran: Vec<String>,
    /// Labels of the steps that succeeded, in the order they ran.
    pub released: Vec<String>,
    /// Labels and errors of the steps that failed, in the order they ran.
    pub failed: Vec<(String, DiskforgeError)>,
}

impl TeardownReport {
    /// Returns whether every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Converts the report into an error naming the failed steps.
    ///
    /// # Errors
    ///
    /// Returns `DiskforgeError::Teardown` if any step failed.
    pub fn into_result(self) -> Result<()> {
        if self.failed.is_empty() {
            Ok(())
        } else {
            Err(DiskforgeError::Teardown {
                failed: self.failed.into_iter().map(|(label, _)| label).collect(),
            })
        }
    }
}

/// LIFO stack of release steps.
#[derive(Debug, Default)]
pub struct ResourceStack {
    guards: Vec<ReleaseGuard>,
}

impl ResourceStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a release step on top of the stack.
    pub fn push<F>(&mut self, kind: ResourceKind, label: impl Into<String>, release: F)
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let label = label.into();
        tracing::debug!(?kind, %label, "release step registered");
        self.guards.push(ReleaseGuard {
            kind,
            label,
            release: Box::new(release),
        });
    }

    /// Number of pending release steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// Returns whether nothing is left to release.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Labels of the pending steps, bottom (first acquired) first.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.guards.iter().map(ReleaseGuard::label).collect()
    }

    /// Runs the top step early if it is of `kind`.
    ///
    /// Returns `None` if the top of the stack is another kind. A step that
    /// fails goes back on the stack so teardown tries it again.
    pub fn release_top(&mut self, kind: ResourceKind) -> Option<Result<()>> {
        if self.guards.last()?.kind != kind {
            return None;
        }
        let mut guard = self.guards.pop()?;
        match (guard.release)() {
            Ok(()) => {
                tracing::debug!(label = %guard.label, "released");
                Some(Ok(()))
            }
            Err(e) => {
                tracing::warn!(label = %guard.label, error = %e, "early release failed");
                self.guards.push(guard);
                Some(Err(e))
            }
        }
    }

    /// Runs every pending step, newest first, absorbing failures.
    ///
    /// Calling it again releases nothing.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        while let Some(mut guard) = self.guards.pop() {
            report.ran.push(guard.label.clone());
            match (guard.release)() {
                Ok(()) => {
                    tracing::debug!(label = %guard.label, "released");
                    report.released.push(guard.label);
                }
                Err(e) => {
                    tracing::warn!(label = %guard.label, error = %e, "release failed, continuing teardown");
                    report.failed.push((guard.label, e));
                }
            }
        }
        report
    }
}
