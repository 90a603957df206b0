use crate::catchup::CatchupError;
use crate::consensus::LogIndex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Replica error types
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("no upstream member available")]
    NoUpstream,

    #[error("entries arrived out of order: expected {expected}, got {got}")]
    OutOfOrder { expected: LogIndex, got: LogIndex },

    #[error("upstream served an entry past its commit index {commit_index}: {index}")]
    PastCommit {
        index: LogIndex,
        commit_index: LogIndex,
    },

    #[error(
        "store identity mismatch against every source; replica halted (operator action required)"
    )]
    ForeignStore,

    #[error("catch-up error: {0}")]
    Catchup(#[from] CatchupError),

    #[error("state machine error: {0}")]
    StateMachine(#[from] crate::state_machine::StateMachineError),
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Replication statistics for one replica.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaStats {
    /// Last index applied locally.
    pub last_applied: LogIndex,
    /// Upstream commit index from the most recent poll.
    pub upstream_commit: LogIndex,
    /// Operations behind the upstream.
    pub lag_operations: u64,
    /// Total entries applied since start.
    pub total_applied: u64,
    /// Unix timestamp of the last successful poll.
    pub last_poll: u64,
    /// True while the loop is paused.
    pub paused: bool,
    /// True once the replica halted on a store identity conflict.
    pub halted: bool,
}
