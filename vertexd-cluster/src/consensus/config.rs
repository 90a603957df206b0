use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Lower bound of the randomized election timeout (ms).
    pub election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout (ms).
    pub election_timeout_max_ms: u64,

    /// Leader heartbeat interval (ms).
    pub heartbeat_interval_ms: u64,

    /// Run a non-binding pre-vote round before real elections.
    pub pre_vote: bool,

    /// This member votes but never stands for election.
    pub refuse_to_be_leader: bool,

    /// Maximum entries shipped in one AppendEntries batch.
    pub max_append_batch: usize,

    /// How long a submitted write may wait for commit before failing.
    pub commit_timeout_ms: u64,

    /// How often the log pruning pass runs (ms).
    pub prune_interval_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 600,
            heartbeat_interval_ms: 100,
            pre_vote: true,
            refuse_to_be_leader: false,
            max_append_batch: 64,
            commit_timeout_ms: 10_000, // 10 seconds
            prune_interval_ms: 60_000, // 1 minute
        }
    }
}

impl ConsensusConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.election_timeout_min_ms == 0 {
            return Err("election_timeout_min_ms must be positive".to_string());
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err("election timeout range is inverted".to_string());
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err("heartbeat interval must be below the election timeout".to_string());
        }
        if self.max_append_batch == 0 {
            return Err("max_append_batch must be positive".to_string());
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Window within which a leader must hear from a majority before it
    /// steps down rather than serve stale reads and writes.
    pub fn leader_lease(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}
