//! Consensus core
//!
//! `RaftCore` owns one event-loop task per member: every role
//! transition, vote, and commit advancement runs inside it, serialized
//! by construction, while RPC handling and timers feed it through an
//! inbox channel. A second task drains committed entries to the
//! storage engine so apply lag never blocks consensus.

use super::config::ConsensusConfig;
use super::state::{CatchupNeeded, RaftState};
use super::types::{
    ConsensusError, ConsensusResult, LogEntry, LogIndex, MemberId, Payload, RaftMessage,
    RaftStatus, Term,
};
use crate::clock::Clock;
use crate::membership::ClusterConfiguration;
use crate::raft_log::SegmentedLog;
use crate::state_machine::StateMachineAdapter;
use crate::transport::RaftTransport;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant as TokioInstant, interval, sleep_until, timeout};
use tracing::{debug, error, info, warn};

type CommitReply = oneshot::Sender<ConsensusResult<LogIndex>>;

enum RaftEvent {
    Message {
        from: MemberId,
        message: RaftMessage,
    },
    Submit {
        payload: Payload,
        reply: CommitReply,
    },
    AddMember {
        member: MemberId,
        reply: CommitReply,
    },
    RemoveMember {
        member: MemberId,
        reply: CommitReply,
    },
    TriggerElection,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one member's consensus state machine.
pub struct RaftCore {
    id: MemberId,
    config: ConsensusConfig,
    events: mpsc::UnboundedSender<RaftEvent>,
    status: Arc<RwLock<RaftStatus>>,
    commit_index: Arc<AtomicU64>,
    applied: Arc<AtomicU64>,
    catchup_rx: Mutex<Option<mpsc::UnboundedReceiver<CatchupNeeded>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RaftCore {
    /// Build the state machine and start its event loop and apply
    /// task. `state_dir` holds the persisted vote state.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: MemberId,
        config: ConsensusConfig,
        initial: ClusterConfiguration,
        log: Arc<SegmentedLog>,
        adapter: Arc<dyn StateMachineAdapter>,
        transport: Arc<dyn RaftTransport>,
        clock: Arc<dyn Clock>,
        state_dir: &Path,
    ) -> ConsensusResult<Arc<Self>> {
        config.validate().map_err(ConsensusError::InvalidConfig)?;

        let state = RaftState::new(
            id,
            config.clone(),
            initial,
            Arc::clone(&log),
            Arc::clone(&clock),
            state_dir,
        )?;

        let applied = Arc::new(AtomicU64::new(adapter.last_applied()));
        let commit_index = Arc::new(AtomicU64::new(0));
        let status = Arc::new(RwLock::new(state.status(applied.load(Ordering::SeqCst))));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (catchup_tx, catchup_rx) = mpsc::unbounded_channel();

        tokio::spawn(apply_loop(apply_rx, adapter, Arc::clone(&applied)));

        let handle = tokio::spawn(event_loop(
            state,
            events_rx,
            transport,
            clock,
            apply_tx,
            catchup_tx,
            Arc::clone(&status),
            Arc::clone(&commit_index),
            Arc::clone(&applied),
        ));

        Ok(Arc::new(Self {
            id,
            config,
            events: events_tx,
            status,
            commit_index,
            applied,
            catchup_rx: Mutex::new(Some(catchup_rx)),
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub fn member_id(&self) -> MemberId {
        self.id
    }

    /// Feed an inbound peer message into the event loop; wired to the
    /// transport listener.
    pub fn deliver(&self, from: MemberId, message: RaftMessage) {
        let _ = self.events.send(RaftEvent::Message { from, message });
    }

    /// Submit a client command. Resolves with the assigned index once
    /// the entry commits; rejects immediately with `NotLeader` on
    /// non-leaders and times out if no quorum acknowledges.
    pub async fn submit(&self, command: Vec<u8>) -> ConsensusResult<LogIndex> {
        self.submit_payload(Payload::Command(command)).await
    }

    async fn submit_payload(&self, payload: Payload) -> ConsensusResult<LogIndex> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(RaftEvent::Submit {
                payload,
                reply: reply_tx,
            })
            .map_err(|_| ConsensusError::Shutdown)?;
        self.await_commit(reply_rx).await
    }

    /// Add a core member. Resolves once the configuration entry
    /// commits; the member gains its vote after it has caught up.
    pub async fn add_member(&self, member: MemberId) -> ConsensusResult<LogIndex> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(RaftEvent::AddMember {
                member,
                reply: reply_tx,
            })
            .map_err(|_| ConsensusError::Shutdown)?;
        self.await_commit(reply_rx).await
    }

    /// Remove a core member; rejected if the voting set would drop
    /// below the configured minimum.
    pub async fn remove_member(&self, member: MemberId) -> ConsensusResult<LogIndex> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(RaftEvent::RemoveMember {
                member,
                reply: reply_tx,
            })
            .map_err(|_| ConsensusError::Shutdown)?;
        self.await_commit(reply_rx).await
    }

    async fn await_commit(
        &self,
        reply: oneshot::Receiver<ConsensusResult<LogIndex>>,
    ) -> ConsensusResult<LogIndex> {
        match timeout(self.config.commit_timeout(), reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConsensusError::Shutdown),
            Err(_) => Err(ConsensusError::CommitTimeout),
        }
    }

    /// Operational control: stand for election immediately.
    pub fn trigger_election(&self) {
        let _ = self.events.send(RaftEvent::TriggerElection);
    }

    /// Current role, term, commit index and voting set.
    pub fn status(&self) -> RaftStatus {
        self.status.read().clone()
    }

    /// Shared commit watermark, consumed by the catch-up server.
    pub fn commit_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.commit_index)
    }

    /// Shared applied watermark.
    pub fn applied_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.applied)
    }

    /// Stream of "fall back to snapshot catch-up" signals, emitted
    /// when a leader reports pruning past this member's log. The node
    /// assembly wires this to the catch-up client. Can be taken once.
    pub fn take_catchup_signals(&self) -> Option<mpsc::UnboundedReceiver<CatchupNeeded>> {
        self.catchup_rx.lock().take()
    }

    /// Stop the event loop, draining in-flight local work first.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .events
            .send(RaftEvent::Shutdown { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.await;
        }
    }
}

/// Applies committed entries to the storage engine, strictly in index
/// order. Configuration and barrier entries only advance the
/// watermark.
async fn apply_loop(
    mut rx: mpsc::UnboundedReceiver<LogEntry>,
    adapter: Arc<dyn StateMachineAdapter>,
    applied: Arc<AtomicU64>,
) {
    while let Some(entry) = rx.recv().await {
        if matches!(entry.payload, Payload::Command(_)) {
            if let Err(e) = adapter.apply(&entry).await {
                error!("Apply failed at index {}: {}; halting apply loop", entry.index, e);
                return;
            }
        }
        applied.store(entry.index, Ordering::SeqCst);
    }
}

#[allow(clippy::too_many_arguments)]
async fn event_loop(
    mut state: RaftState,
    mut events: mpsc::UnboundedReceiver<RaftEvent>,
    transport: Arc<dyn RaftTransport>,
    clock: Arc<dyn Clock>,
    apply_tx: mpsc::UnboundedSender<LogEntry>,
    catchup_tx: mpsc::UnboundedSender<CatchupNeeded>,
    status: Arc<RwLock<RaftStatus>>,
    commit_index: Arc<AtomicU64>,
    applied: Arc<AtomicU64>,
) {
    let id = state.id;
    let mut election_deadline = TokioInstant::now() + state.random_election_timeout();
    let mut heartbeat = interval(state.config.heartbeat_interval());
    let mut prune = interval(std::time::Duration::from_millis(
        state.config.prune_interval_ms.max(1),
    ));
    // Commit waiters: index -> (term at submission, repliers)
    let mut waiters: BTreeMap<LogIndex, (Term, Vec<CommitReply>)> = BTreeMap::new();
    let mut dispatched = applied.load(Ordering::SeqCst);

    loop {
        let result = tokio::select! {
            event = events.recv() => match event {
                None => break,
                Some(RaftEvent::Shutdown { reply }) => {
                    let _ = state.log.flush();
                    let _ = reply.send(());
                    break;
                }
                Some(event) => handle_event(&mut state, event, &mut waiters),
            },
            _ = sleep_until(election_deadline) => state.on_election_timeout(),
            _ = heartbeat.tick() => state.on_heartbeat_tick(clock.now()),
            _ = prune.tick() => {
                let safe = state.commit_index.min(applied.load(Ordering::SeqCst));
                match state.log.prune(safe) {
                    Ok(0) => {}
                    Ok(segments) => debug!("Pruned {} log segments", segments),
                    Err(e) => warn!("Log pruning failed: {}", e),
                }
                Ok(Vec::new())
            }
        };

        match result {
            Ok(outbound) => {
                for message in outbound {
                    if let Err(e) = transport.send(message.to, message.message).await {
                        debug!("Send to {} failed: {}", message.to, e);
                    }
                }
            }
            Err(e) => warn!("Consensus event failed on {}: {}", id, e),
        }

        if state.take_election_reset() {
            election_deadline = TokioInstant::now() + state.random_election_timeout();
        }

        // Waiters only make sense while we lead
        if state.role() != super::types::RaftRole::Leader && !waiters.is_empty() {
            for (_, (_, repliers)) in std::mem::take(&mut waiters) {
                for reply in repliers {
                    let _ = reply.send(Err(ConsensusError::LeadershipLost));
                }
            }
        }

        // Hand newly committed entries to the apply task and resolve
        // commit waiters
        let commit = state.commit_index;
        if commit > dispatched {
            for index in (dispatched + 1)..=commit {
                if let Some(entry) = state.log.entry(index) {
                    let _ = apply_tx.send(entry);
                }
            }
            dispatched = commit;
            commit_index.store(commit, Ordering::SeqCst);

            let pending = std::mem::take(&mut waiters);
            for (index, (term, repliers)) in pending {
                if index > commit {
                    waiters.insert(index, (term, repliers));
                    continue;
                }
                let survived = state.log.entry_term(index) == Some(term);
                for reply in repliers {
                    let _ = reply.send(if survived {
                        Ok(index)
                    } else {
                        Err(ConsensusError::LeadershipLost)
                    });
                }
            }
        }

        if let Some(needed) = state.take_catchup_needed() {
            let _ = catchup_tx.send(needed);
        }

        *status.write() = state.status(applied.load(Ordering::SeqCst));
    }

    info!("Consensus event loop for {} stopped", id);
}

fn handle_event(
    state: &mut RaftState,
    event: RaftEvent,
    waiters: &mut BTreeMap<LogIndex, (Term, Vec<CommitReply>)>,
) -> ConsensusResult<Vec<super::state::Outbound>> {
    match event {
        RaftEvent::Message { from, message } => {
            let now = state.clock_now();
            state.handle_message(from, message, now)
        }
        RaftEvent::Submit { payload, reply } => submit_with_reply(state, payload, reply, waiters),
        RaftEvent::AddMember { member, reply } => match state.membership.prepare_add(member) {
            Ok(config) => {
                submit_with_reply(state, Payload::Configuration(config), reply, waiters)
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                Ok(Vec::new())
            }
        },
        RaftEvent::RemoveMember { member, reply } => {
            match state.membership.prepare_remove(member) {
                Ok(config) => {
                    submit_with_reply(state, Payload::Configuration(config), reply, waiters)
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                    Ok(Vec::new())
                }
            }
        }
        RaftEvent::TriggerElection => state.trigger_election(),
        RaftEvent::Shutdown { .. } => unreachable!("handled by the event loop"),
    }
}

fn submit_with_reply(
    state: &mut RaftState,
    payload: Payload,
    reply: CommitReply,
    waiters: &mut BTreeMap<LogIndex, (Term, Vec<CommitReply>)>,
) -> ConsensusResult<Vec<super::state::Outbound>> {
    match state.submit(payload) {
        Ok((index, outbound)) => {
            waiters
                .entry(index)
                .or_insert_with(|| (state.hard.term, Vec::new()))
                .1
                .push(reply);
            Ok(outbound)
        }
        Err(e) => {
            let _ = reply.send(Err(e));
            Ok(Vec::new())
        }
    }
}

