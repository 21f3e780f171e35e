//! Guest session: the contract between the orchestrator and the
//! virtualization control plane.
//!
//! # Modules
//!
//! - [`vmrun`] - `VmrunHypervisor`, a backend driving VMware's `vmrun` tool
//!
//! Every primitive on [`GuestSession`] is blocking. Callers that need a
//! wall-clock bound wrap them with [`crate::bounded::run_bounded`].

pub mod vmrun;

use crate::config::GuestCredentials;
use crate::error::{GuestError, GuestResult};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub use vmrun::{VmrunHypervisor, VmrunSession};

/// Opens guest sessions. One implementation per control plane.
pub trait Hypervisor: Send + Sync {
    /// Connect to the virtualization host, optionally register the
    /// descriptor, and open the guest image.
    fn connect(&self, descriptor: &Path) -> GuestResult<Arc<dyn GuestSession>>;
}

/// Live handle to one guest instance.
///
/// Shared behind an `Arc` so that bounded operations can run on helper
/// threads; it is still owned by exactly one bundle run.
pub trait GuestSession: Send + Sync {
    /// Descriptor this session was opened from.
    fn descriptor(&self) -> &Path;

    /// Number of stored snapshots.
    fn snapshot_count(&self) -> GuestResult<usize>;

    /// Revert to the snapshot at `index` (zero-based, oldest first).
    /// Callers go through [`revert_to_snapshot`] for range checking.
    fn revert_to_snapshot_at(&self, index: usize) -> GuestResult<()>;

    fn power_on(&self) -> GuestResult<()>;

    /// Block until guest tools report ready. Implementations stop polling
    /// once `timeout` has elapsed.
    fn wait_for_tools(&self, timeout: Duration) -> GuestResult<()>;

    fn login(&self, credentials: &GuestCredentials) -> GuestResult<()>;

    fn copy_to_guest(&self, host: &Path, guest: &str) -> GuestResult<()>;

    fn copy_from_guest(&self, guest: &str, host: &Path) -> GuestResult<()>;

    /// Run `command` through the guest shell at `shell`.
    fn run_in_guest(&self, shell: &str, command: &str) -> GuestResult<()>;

    fn power_off(&self) -> GuestResult<()>;

    /// Whether `connect` registered the descriptor with the host.
    fn is_registered(&self) -> bool;

    fn unregister(&self) -> GuestResult<()>;
}

/// Which stored snapshot to revert to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotSelector {
    /// The highest-indexed (most recent) snapshot.
    #[default]
    Latest,
    Index(usize),
}

/// Revert `session` to the selected snapshot and return the index used.
///
/// An out-of-range index fails with [`GuestError::Snapshot`] before any
/// guest state is touched.
pub fn revert_to_snapshot(
    session: &dyn GuestSession,
    selector: SnapshotSelector,
) -> GuestResult<usize> {
    let count = session.snapshot_count()?;
    let index = match selector {
        SnapshotSelector::Latest => count.checked_sub(1).ok_or(GuestError::NoSnapshots)?,
        SnapshotSelector::Index(index) => index,
    };
    if index >= count {
        return Err(GuestError::Snapshot { index, count });
    }

    debug!(index, count, "reverting guest to snapshot");
    session.revert_to_snapshot_at(index)?;
    info!(index, "guest reverted to snapshot");
    Ok(index)
}

/// A guest-side directory whose string form ends with the guest's native
/// path separator (`/` or `\`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuestDir(String);

impl GuestDir {
    pub fn new(base: impl Into<String>) -> GuestResult<Self> {
        let base = base.into();
        if base.ends_with('/') || base.ends_with('\\') {
            Ok(Self(base))
        } else {
            Err(GuestError::InvalidGuestPath(base))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a bare file name to the directory.
    pub fn join(&self, name: &str) -> GuestResult<String> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(GuestError::InvalidGuestFileName(name.to_string()));
        }
        Ok(format!("{}{}", self.0, name))
    }
}

impl std::fmt::Display for GuestDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
