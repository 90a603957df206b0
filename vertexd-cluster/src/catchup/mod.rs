//! Snapshot catch-up and transaction pull
//!
//! Repairs members whose divergence incremental replication cannot
//! fix, and feeds read replicas their committed entries:
//! - `CatchupServer` serves committed-entry pulls and store-copy
//!   snapshot streams on a dedicated listener
//! - `CatchupClient` pulls entries, downloads snapshots (store
//!   identity checked before any byte is applied), and installs them
//! - `CopyGuard` is the exclusive "store is stopped to copy store"
//!   latch; transaction starts are refused while it is held

mod client;
mod server;
mod types;

pub use client::{CatchupClient, PullBatch, StagedSnapshot, install_snapshot};
pub use server::CatchupServer;
pub use types::{
    CatchupConfig, CatchupError, CatchupRequest, CatchupResponse, Result, SnapshotManifest,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Exclusive latch held while a snapshot install replaces the store.
///
/// The transaction layer consults `is_copying` before admitting new
/// work; `try_acquire` refuses a second concurrent install.
#[derive(Clone, Default)]
pub struct CopyGuard {
    copying: Arc<AtomicBool>,
}

impl CopyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while the store is offline for a copy.
    pub fn is_copying(&self) -> bool {
        self.copying.load(Ordering::SeqCst)
    }

    /// Take the latch; fails if an install is already running.
    pub fn try_acquire(&self) -> Result<CopyPermit> {
        if self
            .copying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CatchupError::CopyInProgress);
        }
        Ok(CopyPermit {
            copying: Arc::clone(&self.copying),
        })
    }
}

/// Released on drop.
pub struct CopyPermit {
    copying: Arc<AtomicBool>,
}

impl Drop for CopyPermit {
    fn drop(&mut self) {
        self.copying.store(false, Ordering::SeqCst);
    }
}
