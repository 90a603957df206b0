//! Read replica synchronization
//!
//! Each read replica runs an independent polling loop: pick an
//! upstream member, pull committed entries since the last applied
//! index, and apply them through the storage adapter in strict order.
//! A replica holds no vote, never appends client writes, and observes
//! a prefix of the leader's committed log; when its upstream has
//! pruned past it (or its store is still empty) it falls back to a
//! full store copy from a core member.
//!
//! The loop is an explicit cancellable task with channel-based
//! pause/resume: pause is immediate and idempotent, resume continues
//! from the last applied index with no loss and no duplicates.

mod config;
mod types;
mod upstream;

pub use config::ReplicaConfig;
pub use types::{ReplicaError, ReplicaStats, Result};
pub use upstream::{AnyCoreMember, ChooseUpstream, PreferredMember, ServerGroup};

use crate::catchup::{CatchupClient, CatchupError, CopyGuard, PullBatch, install_snapshot};
use crate::clock::Clock;
use crate::consensus::MemberId;
use crate::state_machine::{StateMachineAdapter, StoreId};
use crate::topology::{MemberInfo, TopologyView};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use upstream::select_upstream;

/// Handle to one replica's sync loop.
pub struct ReadReplicaSync {
    id: MemberId,
    adapter: Arc<dyn StateMachineAdapter>,
    upstream_commit: Arc<AtomicU64>,
    total_applied: Arc<AtomicU64>,
    last_poll: Arc<AtomicU64>,
    halted: Arc<AtomicBool>,
    paused: watch::Sender<bool>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReadReplicaSync {
    /// Start the polling loop. `strategies` are tried in order each
    /// cycle to choose the upstream.
    pub fn spawn(
        id: MemberId,
        config: ReplicaConfig,
        adapter: Arc<dyn StateMachineAdapter>,
        topology: Arc<dyn TopologyView>,
        strategies: Vec<Box<dyn ChooseUpstream>>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let upstream_commit = Arc::new(AtomicU64::new(0));
        let total_applied = Arc::new(AtomicU64::new(0));
        let last_poll = Arc::new(AtomicU64::new(0));
        let halted = Arc::new(AtomicBool::new(false));
        let (paused_tx, paused_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = SyncWorker {
            id,
            client: CatchupClient::new(config.catchup.clone()),
            config,
            adapter: Arc::clone(&adapter),
            topology,
            strategies,
            guard: CopyGuard::new(),
            upstream_commit: Arc::clone(&upstream_commit),
            total_applied: Arc::clone(&total_applied),
            last_poll: Arc::clone(&last_poll),
            halted: Arc::clone(&halted),
            paused_rx,
            stop_rx,
            clock,
        };
        let handle = tokio::spawn(worker.run());

        Arc::new(Self {
            id,
            adapter,
            upstream_commit,
            total_applied,
            last_poll,
            halted,
            paused: paused_tx,
            stop: stop_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn member_id(&self) -> MemberId {
        self.id
    }

    /// Freeze the replica: no further polling or application until
    /// `resume`. Idempotent; takes effect before the next apply.
    pub fn pause(&self) {
        if !*self.paused.borrow() {
            info!("Replica {} paused", self.id);
        }
        self.paused.send_replace(true);
    }

    /// Resume polling from the last applied index. Idempotent.
    pub fn resume(&self) {
        if *self.paused.borrow() {
            info!("Replica {} resumed", self.id);
        }
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn stats(&self) -> ReplicaStats {
        let last_applied = self.adapter.last_applied();
        let upstream_commit = self.upstream_commit.load(Ordering::SeqCst);
        ReplicaStats {
            last_applied,
            upstream_commit,
            lag_operations: upstream_commit.saturating_sub(last_applied),
            total_applied: self.total_applied.load(Ordering::SeqCst),
            last_poll: self.last_poll.load(Ordering::SeqCst),
            paused: *self.paused.borrow(),
            halted: self.halted.load(Ordering::SeqCst),
        }
    }

    /// Stop the loop and wait for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.await;
        }
    }
}

struct SyncWorker {
    id: MemberId,
    config: ReplicaConfig,
    client: CatchupClient,
    adapter: Arc<dyn StateMachineAdapter>,
    topology: Arc<dyn TopologyView>,
    strategies: Vec<Box<dyn ChooseUpstream>>,
    guard: CopyGuard,
    upstream_commit: Arc<AtomicU64>,
    total_applied: Arc<AtomicU64>,
    last_poll: Arc<AtomicU64>,
    halted: Arc<AtomicBool>,
    paused_rx: watch::Receiver<bool>,
    stop_rx: watch::Receiver<bool>,
    clock: Arc<dyn Clock>,
}

impl SyncWorker {
    async fn run(mut self) {
        info!("Replica sync loop for {} started", self.id);
        let mut ticker = interval(self.config.poll_interval());

        loop {
            tokio::select! {
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }

            if *self.paused_rx.borrow() {
                continue;
            }

            match self.poll_once().await {
                Ok(0) => {}
                Ok(applied) => debug!("Replica {} applied {} entries", self.id, applied),
                Err(ReplicaError::ForeignStore) => {
                    error!(
                        "Replica {} holds a foreign store; halting sync (wipe or re-seed to rejoin)",
                        self.id
                    );
                    self.halted.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => warn!("Replica {} sync cycle failed: {}", self.id, e),
            }
        }

        info!("Replica sync loop for {} stopped", self.id);
    }

    async fn poll_once(&mut self) -> Result<u64> {
        let members = self.topology.members();

        // A replica with an empty store seeds itself with a full copy
        let Some(store_id) = self.adapter.identity() else {
            return self.store_copy_from_core(&members, None).await;
        };

        let upstream = select_upstream(&self.strategies, self.id, &members)
            .ok_or(ReplicaError::NoUpstream)?;
        let info = members.get(&upstream).ok_or(ReplicaError::NoUpstream)?;
        let from_index = self.adapter.last_applied() + 1;

        match self
            .client
            .pull(info.catchup_address, from_index, store_id)
            .await
        {
            Ok(batch) => self.apply_batch(batch).await,
            Err(CatchupError::FallBehind { oldest_available }) => {
                info!(
                    "Upstream {} pruned to {} (we need {}); falling back to store copy",
                    upstream, oldest_available, from_index
                );
                self.store_copy_from_core(&members, Some(store_id)).await
            }
            Err(CatchupError::StoreIdMismatch) => Err(ReplicaError::ForeignStore),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply one pulled batch in strict index order, never past the
    /// upstream's reported commit index.
    async fn apply_batch(&mut self, batch: PullBatch) -> Result<u64> {
        let mut applied = 0u64;

        for entry in batch.entries {
            // Pause takes effect before the next application; the
            // remainder of the batch is re-pulled on resume
            if *self.paused_rx.borrow() {
                break;
            }
            if entry.index > batch.commit_index {
                return Err(ReplicaError::PastCommit {
                    index: entry.index,
                    commit_index: batch.commit_index,
                });
            }
            let expected = self.adapter.last_applied() + 1;
            if entry.index != expected {
                return Err(ReplicaError::OutOfOrder {
                    expected,
                    got: entry.index,
                });
            }

            self.adapter.apply(&entry).await?;
            applied += 1;
        }

        self.upstream_commit
            .store(batch.commit_index, Ordering::SeqCst);
        self.total_applied.fetch_add(applied, Ordering::SeqCst);
        self.last_poll
            .store(self.clock.unix_seconds(), Ordering::SeqCst);
        Ok(applied)
    }

    /// Full-state seed from any reachable core member.
    async fn store_copy_from_core(
        &mut self,
        members: &HashMap<MemberId, MemberInfo>,
        local_store_id: Option<StoreId>,
    ) -> Result<u64> {
        let source = AnyCoreMember
            .choose(self.id, members)
            .ok_or(ReplicaError::NoUpstream)?;
        let info = members.get(&source).ok_or(ReplicaError::NoUpstream)?;

        let staged = self
            .client
            .store_copy(info.catchup_address, local_store_id, &self.config.staging_dir)
            .await
            .map_err(|e| match e {
                CatchupError::StoreIdMismatch => ReplicaError::ForeignStore,
                other => ReplicaError::Catchup(other),
            })?;

        // Replicas hold no raft log; only the store is replaced
        let installed = install_snapshot(&self.guard, &self.adapter, None, staged)
            .await
            .map_err(|e| match e {
                CatchupError::StoreIdMismatch => ReplicaError::ForeignStore,
                other => ReplicaError::Catchup(other),
            })?;

        info!(
            "Replica {} seeded from {} at index {}",
            self.id, source, installed
        );
        self.last_poll
            .store(self.clock.unix_seconds(), Ordering::SeqCst);
        Ok(0)
    }
}
