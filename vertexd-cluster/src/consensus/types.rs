use crate::membership::ClusterConfiguration;
use crate::raft_log::LogStoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Election epoch. Monotonically increasing; a member never votes twice
/// in the same term and never regresses its observed term.
pub type Term = u64;

/// Position in the replicated log. Gapless once assigned; 0 is the
/// empty-log sentinel, real entries start at 1.
pub type LogIndex = u64;

/// Stable identity of a cluster participant, independent of its
/// network address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(Uuid);

impl MemberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough in logs; the full uuid is in Debug
        let hex = self.0.simple().to_string();
        write!(f, "{}", &hex[..8])
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({})", self.0)
    }
}

/// Consensus role. Exactly one per member at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    /// Passive state, listens for appends, votes when asked
    #[default]
    Follower,
    /// Transitional state, requesting votes to become leader
    Candidate,
    /// Active state, replicates the log and sends heartbeats
    Leader,
}

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Opaque storage engine command.
    Command(Vec<u8>),
    /// Membership change, ordered and committed like any other entry.
    Configuration(ClusterConfiguration),
    /// Barrier appended by a freshly elected leader so entries from
    /// earlier terms become committable in its term.
    Noop,
}

/// One entry of the replicated log. Immutable once durably appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub payload: Payload,
}

impl LogEntry {
    pub fn command(index: LogIndex, term: Term, bytes: Vec<u8>) -> Self {
        Self {
            index,
            term,
            payload: Payload::Command(bytes),
        }
    }
}

/// Consensus RPC messages exchanged between core members.
///
/// The sender identity travels in the transport envelope, not in the
/// message body. Heartbeats are empty `AppendRequest`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Non-binding election pre-check; grants mutate no state.
    PreVoteRequest {
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
    },

    PreVoteResponse { term: Term, granted: bool },

    /// Binding vote request for `term`.
    VoteRequest {
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
    },

    VoteResponse { term: Term, granted: bool },

    /// Log replication and heartbeat.
    AppendRequest {
        leader_term: Term,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },

    /// `match_index` is the highest index known replicated on the
    /// responder; `append_index` is its last local index, used by the
    /// leader to jump back quickly after a consistency-check failure.
    AppendResponse {
        term: Term,
        success: bool,
        match_index: LogIndex,
        append_index: LogIndex,
    },

    /// The leader has pruned its log past what this peer needs;
    /// incremental replication cannot repair it and it should fall
    /// back to snapshot catch-up.
    CompactionNotice {
        leader_term: Term,
        oldest_index: LogIndex,
    },
}

/// Point-in-time view of a member's consensus state, for operational
/// reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftStatus {
    pub member_id: MemberId,
    pub role: RaftRole,
    pub term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    /// Leader this member currently recognizes, if any.
    pub leader: Option<MemberId>,
    pub voting_members: Vec<MemberId>,
    pub min_core_size: usize,
    /// False while no majority of the voting set is reachable; new
    /// commits are blocked but the member keeps retrying.
    pub quorum_reachable: bool,
}

/// Consensus error types
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("not the leader (known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<MemberId> },

    #[error("leadership lost before the entry committed")]
    LeadershipLost,

    #[error("commit timed out (no quorum reachable?)")]
    CommitTimeout,

    #[error("consensus core is shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("log store error: {0}")]
    Log(#[from] LogStoreError),

    #[error("membership error: {0}")]
    Membership(#[from] crate::membership::MembershipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ConsensusError {
    fn from(e: bincode::Error) -> Self {
        ConsensusError::Serialization(e.to_string())
    }
}

pub type ConsensusResult<T> = std::result::Result<T, ConsensusError>;
