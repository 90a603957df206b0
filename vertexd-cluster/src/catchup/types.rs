use crate::consensus::{LogEntry, LogIndex, Term};
use crate::raft_log::LogStoreError;
use crate::state_machine::{StateMachineError, StoreId};
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Requests served by the catch-up listener. One request per
/// connection; the response is a stream of frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CatchupRequest {
    /// Committed entries since `from_index`.
    Pull {
        from_index: LogIndex,
        store_id: StoreId,
    },

    /// Full store snapshot. `store_id` is the requester's local store
    /// identity, `None` when its store is still empty.
    StoreCopy { store_id: Option<StoreId> },
}

/// Response frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CatchupResponse {
    /// One batch of committed entries; `more` signals further batches
    /// on this stream.
    Entries {
        entries: Vec<LogEntry>,
        commit_index: LogIndex,
        more: bool,
    },

    /// The requested index was pruned; only a store copy can repair
    /// the requester.
    FallBehind { oldest_available: LogIndex },

    /// The stores are not the same logical store; the requester must
    /// not join.
    StoreIdMismatch,

    /// Head frame of a snapshot stream.
    Manifest(SnapshotManifest),

    /// One snapshot chunk, individually checksummed.
    Chunk { data: Vec<u8>, crc: u32, last: bool },

    /// Source-side failure.
    Failed(String),
}

/// Snapshot stream metadata, also staged to disk as a JSON manifest
/// next to the partial download.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub store_id: StoreId,
    pub total_bytes: u64,
    pub checksum: u32,
}

/// Catch-up error types
#[derive(Debug, Error)]
pub enum CatchupError {
    #[error("store identity mismatch; refusing to join (operator action required)")]
    StoreIdMismatch,

    #[error("source pruned past the requested index; oldest available is {oldest_available}")]
    FallBehind { oldest_available: LogIndex },

    #[error("a store copy is already in progress")]
    CopyInProgress,

    #[error("transfer interrupted: {0}")]
    Interrupted(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("source reported failure: {0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("log store error: {0}")]
    Log(#[from] LogStoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CatchupError {
    fn from(e: serde_json::Error) -> Self {
        CatchupError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CatchupError>;

/// Catch-up configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchupConfig {
    /// Entries per `Entries` frame when serving pulls.
    pub pull_batch_size: usize,

    /// Bytes per snapshot chunk.
    pub chunk_size_bytes: usize,

    /// Connect/request timeout (ms).
    pub request_timeout_ms: u64,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            pull_batch_size: 256,
            chunk_size_bytes: 256 * 1024, // 256 KB
            request_timeout_ms: 30_000,   // 30 seconds
        }
    }
}
