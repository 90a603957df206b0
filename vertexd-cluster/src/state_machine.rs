//! Storage engine adapter
//!
//! The transactional storage engine is an external collaborator: this
//! core hands it committed log entries in order and asks it for full
//! state snapshots during catch-up. The engine's on-disk format is
//! opaque here; snapshots travel as raw bytes plus the applied-index
//! watermark they cover.

use crate::consensus::{LogEntry, LogIndex};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

/// Identity token of a data store instance.
///
/// Created at store formation or inherited from a seeding snapshot. All
/// members of one logical cluster share the same id; a member holding a
/// non-empty store with a different id must refuse to join.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId(Uuid);

impl StoreId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({})", self.0)
    }
}

/// Full-state snapshot handed between members during catch-up.
///
/// Ephemeral transfer artifact, never persisted beyond the copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Highest log index covered by this snapshot.
    pub last_applied: LogIndex,
    /// Identity of the store the snapshot was taken from.
    pub store_id: StoreId,
    /// Opaque storage engine state.
    pub bytes: Vec<u8>,
}

/// State machine error types
#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("apply failed at index {index}: {reason}")]
    ApplyFailed { index: LogIndex, reason: String },

    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("install failed: {0}")]
    InstallFailed(String),

    #[error("store identity mismatch: local {local}, snapshot {remote}")]
    IdentityMismatch { local: StoreId, remote: StoreId },
}

pub type Result<T> = std::result::Result<T, StateMachineError>;

/// Interface the storage engine exposes to this core.
#[async_trait]
pub trait StateMachineAdapter: Send + Sync {
    /// Apply one committed entry. Called strictly in index order.
    async fn apply(&self, entry: &LogEntry) -> Result<()>;

    /// Freeze a consistent point-in-time snapshot of the whole store.
    async fn snapshot(&self) -> Result<SnapshotData>;

    /// Replace the whole store with the given snapshot.
    async fn install(&self, snapshot: SnapshotData) -> Result<()>;

    /// Identity of the local store, `None` while the store is empty.
    fn identity(&self) -> Option<StoreId>;

    /// Highest index this store has applied.
    fn last_applied(&self) -> LogIndex;
}

/// Reference adapter keeping applied commands in memory.
///
/// Backs the test suites of every module in this crate; real
/// deployments wire in the storage engine instead.
pub struct InMemoryStateMachine {
    store_id: Mutex<Option<StoreId>>,
    applied: Mutex<Vec<(LogIndex, Vec<u8>)>>,
    last_applied: AtomicU64,
}

impl InMemoryStateMachine {
    /// Empty store with no identity yet (a fresh member).
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            store_id: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            last_applied: AtomicU64::new(0),
        })
    }

    /// Formed store carrying an identity.
    pub fn with_store_id(store_id: StoreId) -> Arc<Self> {
        Arc::new(Self {
            store_id: Mutex::new(Some(store_id)),
            applied: Mutex::new(Vec::new()),
            last_applied: AtomicU64::new(0),
        })
    }

    /// Commands applied so far, in order.
    pub fn commands(&self) -> Vec<(LogIndex, Vec<u8>)> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl StateMachineAdapter for InMemoryStateMachine {
    async fn apply(&self, entry: &LogEntry) -> Result<()> {
        if let crate::consensus::Payload::Command(bytes) = &entry.payload {
            self.applied.lock().push((entry.index, bytes.clone()));
        }
        self.last_applied.store(entry.index, Ordering::SeqCst);
        Ok(())
    }

    async fn snapshot(&self) -> Result<SnapshotData> {
        let store_id = self
            .store_id
            .lock()
            .ok_or_else(|| StateMachineError::SnapshotFailed("store is empty".to_string()))?;

        let bytes = bincode::serialize(&*self.applied.lock())
            .map_err(|e| StateMachineError::SnapshotFailed(e.to_string()))?;

        Ok(SnapshotData {
            last_applied: self.last_applied.load(Ordering::SeqCst),
            store_id,
            bytes,
        })
    }

    async fn install(&self, snapshot: SnapshotData) -> Result<()> {
        if let Some(local) = *self.store_id.lock() {
            if local != snapshot.store_id {
                return Err(StateMachineError::IdentityMismatch {
                    local,
                    remote: snapshot.store_id,
                });
            }
        }

        let commands: Vec<(LogIndex, Vec<u8>)> = bincode::deserialize(&snapshot.bytes)
            .map_err(|e| StateMachineError::InstallFailed(e.to_string()))?;

        *self.store_id.lock() = Some(snapshot.store_id);
        *self.applied.lock() = commands;
        self.last_applied
            .store(snapshot.last_applied, Ordering::SeqCst);
        Ok(())
    }

    fn identity(&self) -> Option<StoreId> {
        *self.store_id.lock()
    }

    fn last_applied(&self) -> LogIndex {
        self.last_applied.load(Ordering::SeqCst)
    }
}
