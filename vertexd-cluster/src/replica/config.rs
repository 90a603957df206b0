use crate::catchup::CatchupConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Read replica configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// How often the sync loop polls its upstream (ms).
    pub poll_interval_ms: u64,

    /// Scratch directory for snapshot downloads.
    pub staging_dir: PathBuf,

    /// Catch-up protocol settings.
    pub catchup: CatchupConfig,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000, // 1 second
            staging_dir: PathBuf::from("./data/staging"),
            catchup: CatchupConfig::default(),
        }
    }
}

impl ReplicaConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
