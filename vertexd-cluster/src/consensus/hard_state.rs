//! Persisted vote state
//!
//! `currentTerm` and `votedFor` must reach stable storage before any
//! vote or append reply leaves this member; otherwise a crash could
//! let it vote twice in one term. Writes go through a temp file and
//! an atomic rename, fsync'd before the rename.

use super::types::{ConsensusResult, MemberId, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "raft-state.json";

/// The slice of consensus state that survives restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<MemberId>,
}

pub(crate) struct HardStateStore {
    path: PathBuf,
    temp_path: PathBuf,
}

impl HardStateStore {
    pub fn open(dir: &Path) -> ConsensusResult<(Self, HardState)> {
        fs::create_dir_all(dir)?;

        let store = Self {
            path: dir.join(STATE_FILE),
            temp_path: dir.join(format!("{}.tmp", STATE_FILE)),
        };

        let state = if store.path.exists() {
            let file = File::open(&store.path)?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| super::types::ConsensusError::Serialization(e.to_string()))?
        } else {
            HardState::default()
        };

        Ok((store, state))
    }

    /// Durably persist the state. Callers must not reply to any vote
    /// or append RPC until this returns.
    pub fn save(&self, state: &HardState) -> ConsensusResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, state)
            .map_err(|e| super::types::ConsensusError::Serialization(e.to_string()))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&self.temp_path, &self.path)?;
        Ok(())
    }
}
