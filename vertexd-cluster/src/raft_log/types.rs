use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Log store error types
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted log record in {segment:?} at offset {offset}")]
    Corrupted { segment: PathBuf, offset: u64 },

    #[error("non-contiguous append: expected index {expected}, got {got}")]
    NonContiguous { expected: u64, got: u64 },

    #[error("index {index} outside the retained window [{oldest}, {latest}]")]
    OutOfRange { index: u64, oldest: u64, latest: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<bincode::Error> for LogStoreError {
    fn from(e: bincode::Error) -> Self {
        LogStoreError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LogStoreError>;

/// Fsync mode for log appends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FsyncMode {
    /// Fsync after every append (safest, slowest)
    Always,
    /// Fsync periodically (balanced)
    Periodic,
    /// Never fsync, rely on OS buffer flush (fastest, least safe)
    Never,
}

/// How much of the already-applied log to retain for follower catch-up.
///
/// Pruning only ever deletes whole sealed segments, and never crosses
/// the commit/apply boundary regardless of strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneStrategy {
    /// Keep nothing beyond what safety requires.
    KeepNone,
    /// Keep at least this many of the newest entries.
    KeepEntries(u64),
    /// Keep at least this many of the newest segments.
    KeepSegments(usize),
}

/// Log store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStoreConfig {
    /// Directory holding segment files and log metadata.
    pub directory: PathBuf,

    /// A new segment opens once the active one exceeds this size.
    pub segment_size_bytes: u64,

    /// Durability mode for appends. Vote and append replies imply
    /// durability, so consensus members run with `Always`.
    pub fsync_mode: FsyncMode,

    /// Fsync cadence when the mode is `Periodic` (ms).
    pub fsync_interval_ms: u64,

    /// Retention policy applied by the pruning pass.
    pub prune_strategy: PruneStrategy,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data/raft"),
            segment_size_bytes: 8 * 1024 * 1024, // 8 MB
            fsync_mode: FsyncMode::Always,
            fsync_interval_ms: 1000,
            prune_strategy: PruneStrategy::KeepEntries(4096),
        }
    }
}

impl LogStoreConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.segment_size_bytes == 0 {
            return Err("segment_size_bytes must be positive".to_string());
        }
        if let PruneStrategy::KeepSegments(0) = self.prune_strategy {
            return Err("keep_segments requires at least one segment".to_string());
        }
        Ok(())
    }
}
