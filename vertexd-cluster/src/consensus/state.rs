//! Consensus state machine
//!
//! All mutable consensus state lives here, owned by the single event
//! loop in `core.rs`. Handlers are synchronous: they take a message or
//! timer event, mutate state, and hand back the messages to send. Vote
//! state is persisted before any reply is produced.

use super::config::ConsensusConfig;
use super::hard_state::{HardState, HardStateStore};
use super::types::{
    ConsensusError, ConsensusResult, LogEntry, LogIndex, MemberId, Payload, RaftMessage, RaftRole,
    RaftStatus, Term,
};
use crate::clock::Clock;
use crate::membership::{ClusterConfiguration, MembershipManager};
use crate::raft_log::SegmentedLog;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A message to hand to the transport.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub to: MemberId,
    pub message: RaftMessage,
}

/// Raised when incremental replication cannot repair this member and
/// it must fall back to snapshot catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchupNeeded {
    /// Peer that reported pruning past our log.
    pub source: MemberId,
    /// Oldest index that peer still retains.
    pub oldest_index: LogIndex,
}

/// Replication bookkeeping the leader holds per peer.
#[derive(Debug)]
pub(crate) struct FollowerProgress {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    pub last_ack: Option<Instant>,
    /// Set once we told the peer to snapshot-catchup, cleared on the
    /// first successful append, so the notice is not spammed.
    pub notified_compaction: bool,
}

pub(crate) struct LeaderState {
    pub progress: HashMap<MemberId, FollowerProgress>,
    pub since: Instant,
}

pub(crate) enum RoleState {
    Follower {
        leader: Option<MemberId>,
        /// Tally of a running pre-vote round, if any.
        pre_votes: Option<HashSet<MemberId>>,
    },
    Candidate {
        votes: HashSet<MemberId>,
    },
    Leader(LeaderState),
}

pub(crate) struct RaftState {
    pub id: MemberId,
    pub config: ConsensusConfig,
    pub hard: HardState,
    hard_store: HardStateStore,
    pub role: RoleState,
    pub commit_index: LogIndex,
    pub membership: MembershipManager,
    pub log: Arc<SegmentedLog>,
    clock: Arc<dyn Clock>,
    election_reset: bool,
    catchup_needed: Option<CatchupNeeded>,
}

impl RaftState {
    pub fn new(
        id: MemberId,
        config: ConsensusConfig,
        initial: ClusterConfiguration,
        log: Arc<SegmentedLog>,
        clock: Arc<dyn Clock>,
        state_dir: &Path,
    ) -> ConsensusResult<Self> {
        let (hard_store, hard) = HardStateStore::open(state_dir)?;

        let mut membership = MembershipManager::new(initial);

        // Recover any configuration entry sitting in the retained log;
        // the newest one governs until overridden
        let oldest = log.oldest_available_index();
        let latest = log.latest_index();
        for index in oldest..=latest {
            if let Some(entry) = log.entry(index) {
                if let Payload::Configuration(config) = entry.payload {
                    membership.on_append(index, config);
                }
            }
        }

        info!(
            "Consensus state for {} recovered: term={}, log window [{}, {}]",
            id, hard.term, oldest, latest
        );

        Ok(Self {
            id,
            config,
            hard,
            hard_store,
            role: RoleState::Follower {
                leader: None,
                pre_votes: None,
            },
            commit_index: 0,
            membership,
            log,
            clock,
            election_reset: false,
            catchup_needed: None,
        })
    }

    pub fn clock_now(&self) -> Instant {
        self.clock.now()
    }

    pub fn role(&self) -> RaftRole {
        match self.role {
            RoleState::Follower { .. } => RaftRole::Follower,
            RoleState::Candidate { .. } => RaftRole::Candidate,
            RoleState::Leader(_) => RaftRole::Leader,
        }
    }

    pub fn leader_hint(&self) -> Option<MemberId> {
        match &self.role {
            RoleState::Follower { leader, .. } => *leader,
            RoleState::Candidate { .. } => None,
            RoleState::Leader(_) => Some(self.id),
        }
    }

    /// True once per election-timer-relevant event; the event loop
    /// re-arms its randomized deadline when it observes this.
    pub fn take_election_reset(&mut self) -> bool {
        std::mem::take(&mut self.election_reset)
    }

    pub fn take_catchup_needed(&mut self) -> Option<CatchupNeeded> {
        self.catchup_needed.take()
    }

    /// Randomized election timeout for the next deadline.
    pub fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(
            self.config.election_timeout_min_ms..=self.config.election_timeout_max_ms,
        );
        Duration::from_millis(ms)
    }

    pub fn status(&self, last_applied: LogIndex) -> RaftStatus {
        let quorum_reachable = match &self.role {
            RoleState::Leader(leader) => self.lease_satisfied(leader, self.clock.now()),
            RoleState::Follower { leader, .. } => leader.is_some(),
            RoleState::Candidate { .. } => false,
        };

        RaftStatus {
            member_id: self.id,
            role: self.role(),
            term: self.hard.term,
            commit_index: self.commit_index,
            last_applied,
            leader: self.leader_hint(),
            voting_members: self.membership.active().voting.iter().copied().collect(),
            min_core_size: self.membership.active().min_core_size,
            quorum_reachable,
        }
    }

    // ---- message dispatch ------------------------------------------------

    pub fn handle_message(
        &mut self,
        from: MemberId,
        message: RaftMessage,
        now: Instant,
    ) -> ConsensusResult<Vec<Outbound>> {
        match message {
            RaftMessage::PreVoteRequest {
                term,
                last_log_index,
                last_log_term,
            } => self.handle_pre_vote_request(from, term, last_log_index, last_log_term),
            RaftMessage::PreVoteResponse { term, granted } => {
                self.handle_pre_vote_response(from, term, granted)
            }
            RaftMessage::VoteRequest {
                term,
                last_log_index,
                last_log_term,
            } => self.handle_vote_request(from, term, last_log_index, last_log_term),
            RaftMessage::VoteResponse { term, granted } => {
                self.handle_vote_response(from, term, granted, now)
            }
            RaftMessage::AppendRequest {
                leader_term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_request(
                from,
                leader_term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            RaftMessage::AppendResponse {
                term,
                success,
                match_index,
                append_index,
            } => self.handle_append_response(from, term, success, match_index, append_index, now),
            RaftMessage::CompactionNotice {
                leader_term,
                oldest_index,
            } => self.handle_compaction_notice(from, leader_term, oldest_index),
        }
    }

    // ---- elections -------------------------------------------------------

    /// A vote is granted iff the candidate's log is at least as
    /// up-to-date as ours, compared by (term, index).
    fn log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        (last_log_term, last_log_index) >= (self.log.latest_term(), self.log.latest_index())
    }

    fn handle_pre_vote_request(
        &mut self,
        from: MemberId,
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> ConsensusResult<Vec<Outbound>> {
        // Non-binding: grant or refuse without touching any state
        let granted = term >= self.hard.term && self.log_up_to_date(last_log_index, last_log_term);

        debug!(
            "Pre-vote request from {} for term {}: granted={}",
            from, term, granted
        );
        Ok(vec![Outbound {
            to: from,
            message: RaftMessage::PreVoteResponse {
                term: self.hard.term,
                granted,
            },
        }])
    }

    fn handle_pre_vote_response(
        &mut self,
        from: MemberId,
        term: Term,
        granted: bool,
    ) -> ConsensusResult<Vec<Outbound>> {
        if term > self.hard.term {
            self.become_follower(term, None)?;
            return Ok(Vec::new());
        }

        let quorum = self.membership.quorum();
        let RoleState::Follower {
            pre_votes: Some(tally),
            ..
        } = &mut self.role
        else {
            // No pre-vote round running; stale response
            return Ok(Vec::new());
        };

        if granted {
            tally.insert(from);
        }

        if tally.len() >= quorum {
            debug!(
                "Pre-vote majority reached ({}/{}), starting election",
                tally.len(),
                quorum
            );
            return self.start_election();
        }
        Ok(Vec::new())
    }

    fn handle_vote_request(
        &mut self,
        from: MemberId,
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> ConsensusResult<Vec<Outbound>> {
        if term > self.hard.term {
            self.become_follower(term, None)?;
        }

        let granted = term == self.hard.term
            && self
                .hard
                .voted_for
                .map(|voted| voted == from)
                .unwrap_or(true)
            && self.log_up_to_date(last_log_index, last_log_term);

        if granted && self.hard.voted_for.is_none() {
            self.hard.voted_for = Some(from);
            // Durable before the reply leaves this member
            self.hard_store.save(&self.hard)?;
            self.election_reset = true;
        }

        debug!(
            "Vote request from {} for term {}: granted={}",
            from, term, granted
        );
        Ok(vec![Outbound {
            to: from,
            message: RaftMessage::VoteResponse {
                term: self.hard.term,
                granted,
            },
        }])
    }

    fn handle_vote_response(
        &mut self,
        from: MemberId,
        term: Term,
        granted: bool,
        now: Instant,
    ) -> ConsensusResult<Vec<Outbound>> {
        if term > self.hard.term {
            self.become_follower(term, None)?;
            return Ok(Vec::new());
        }

        let quorum = self.membership.quorum();
        let RoleState::Candidate { votes } = &mut self.role else {
            return Ok(Vec::new()); // stale: role moved on
        };
        if term < self.hard.term {
            return Ok(Vec::new()); // stale: older election
        }

        if granted {
            votes.insert(from);
        }

        if votes.len() >= quorum {
            return self.become_leader(now);
        }
        Ok(Vec::new())
    }

    /// Election timer fired without hearing from a leader.
    pub fn on_election_timeout(&mut self) -> ConsensusResult<Vec<Outbound>> {
        self.election_reset = true;

        if matches!(self.role, RoleState::Leader(_)) {
            return Ok(Vec::new());
        }
        if self.config.refuse_to_be_leader {
            debug!("Election timeout ignored: this member refuses leadership");
            return Ok(Vec::new());
        }
        if !self.membership.active().voting.contains(&self.id) {
            // Pending or removed members never stand
            return Ok(Vec::new());
        }

        match &self.role {
            RoleState::Candidate { .. } => {
                // Split vote or lost votes: bump the term and retry
                self.start_election()
            }
            RoleState::Follower { .. } if self.config.pre_vote => self.start_pre_vote(),
            _ => self.start_election(),
        }
    }

    /// Operational control: stand for election immediately.
    pub fn trigger_election(&mut self) -> ConsensusResult<Vec<Outbound>> {
        if self.config.refuse_to_be_leader {
            warn!("Election trigger ignored: this member refuses leadership");
            return Ok(Vec::new());
        }
        self.election_reset = true;
        self.start_election()
    }

    /// Ask peers whether they would vote for us, without disturbing
    /// any term. Prevents a partitioned member from forcing needless
    /// term increases when it cannot win.
    fn start_pre_vote(&mut self) -> ConsensusResult<Vec<Outbound>> {
        if self.membership.quorum() == 1 {
            return self.start_election();
        }

        info!(
            "{} starting pre-vote round for prospective term {}",
            self.id,
            self.hard.term + 1
        );

        let mut tally = HashSet::new();
        tally.insert(self.id);
        self.role = RoleState::Follower {
            leader: None,
            pre_votes: Some(tally),
        };

        Ok(self.broadcast_vote_request(true))
    }

    fn start_election(&mut self) -> ConsensusResult<Vec<Outbound>> {
        self.hard.term += 1;
        self.hard.voted_for = Some(self.id);
        self.hard_store.save(&self.hard)?;

        info!("{} standing for election in term {}", self.id, self.hard.term);

        let mut votes = HashSet::new();
        votes.insert(self.id);
        self.role = RoleState::Candidate { votes };
        self.election_reset = true;

        if self.membership.quorum() == 1 {
            return self.become_leader(self.clock.now());
        }
        Ok(self.broadcast_vote_request(false))
    }

    fn broadcast_vote_request(&self, pre: bool) -> Vec<Outbound> {
        let term = if pre {
            self.hard.term + 1
        } else {
            self.hard.term
        };
        let last_log_index = self.log.latest_index();
        let last_log_term = self.log.latest_term();

        self.membership
            .active()
            .voting
            .iter()
            .copied()
            .filter(|member| *member != self.id)
            .map(|member| Outbound {
                to: member,
                message: if pre {
                    RaftMessage::PreVoteRequest {
                        term,
                        last_log_index,
                        last_log_term,
                    }
                } else {
                    RaftMessage::VoteRequest {
                        term,
                        last_log_index,
                        last_log_term,
                    }
                },
            })
            .collect()
    }

    fn become_leader(&mut self, now: Instant) -> ConsensusResult<Vec<Outbound>> {
        info!("{} elected leader for term {}", self.id, self.hard.term);

        self.role = RoleState::Leader(LeaderState {
            progress: HashMap::new(),
            since: now,
        });
        self.refresh_progress(now);

        // Barrier entry: commits transitively cover every entry from
        // earlier terms still sitting in the log
        let barrier = LogEntry {
            index: self.log.latest_index() + 1,
            term: self.hard.term,
            payload: Payload::Noop,
        };
        self.log.append(barrier)?;

        self.advance_commit();

        Ok(self.build_all_appends())
    }

    pub(crate) fn become_follower(
        &mut self,
        term: Term,
        leader: Option<MemberId>,
    ) -> ConsensusResult<()> {
        if term > self.hard.term {
            self.hard.term = term;
            self.hard.voted_for = None;
            self.hard_store.save(&self.hard)?;
        }

        if matches!(self.role, RoleState::Leader(_)) {
            info!("{} stepping down in term {}", self.id, self.hard.term);
        }

        self.role = RoleState::Follower {
            leader,
            pre_votes: None,
        };
        self.election_reset = true;
        Ok(())
    }

    // ---- log replication -------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn handle_append_request(
        &mut self,
        from: MemberId,
        leader_term: Term,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> ConsensusResult<Vec<Outbound>> {
        if leader_term < self.hard.term {
            return Ok(vec![Outbound {
                to: from,
                message: RaftMessage::AppendResponse {
                    term: self.hard.term,
                    success: false,
                    match_index: 0,
                    append_index: self.log.latest_index(),
                },
            }]);
        }

        // A valid leader for our term (or newer) exists
        self.become_follower(leader_term, Some(from))?;

        // Consistency check against the entry preceding the batch
        let prev_matches = match self.log.entry_term(prev_log_index) {
            Some(local_term) => local_term == prev_log_term,
            None => false,
        };
        if !prev_matches {
            debug!(
                "Append from {} rejected: no match at prev index {} (term {})",
                from, prev_log_index, prev_log_term
            );
            return Ok(vec![Outbound {
                to: from,
                message: RaftMessage::AppendResponse {
                    term: self.hard.term,
                    success: false,
                    match_index: 0,
                    append_index: self
                        .log
                        .latest_index()
                        .min(prev_log_index.saturating_sub(1)),
                },
            }]);
        }

        let batch_end = prev_log_index + entries.len() as u64;
        let mut to_append = Vec::new();
        for entry in entries {
            if entry.index < self.log.oldest_available_index() {
                // Already covered by a snapshot install
                continue;
            }
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            match self.log.entry_term(entry.index) {
                Some(local_term) if local_term == entry.term => {
                    // Duplicate delivery of an entry we already hold
                    continue;
                }
                Some(_) => {
                    // Two different entries at one index: truncate the
                    // diverging suffix and take the leader's version
                    self.log.truncate_suffix(entry.index)?;
                    self.membership.on_truncate(entry.index);
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }

        for entry in &to_append {
            if let Payload::Configuration(config) = &entry.payload {
                self.membership.on_append(entry.index, config.clone());
            }
        }
        self.log.append_batch(to_append)?;

        // Followers adopt the leader's commit index, capped by what
        // they actually hold
        let new_commit = leader_commit.min(self.log.latest_index());
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.membership.on_commit(new_commit);
        }

        Ok(vec![Outbound {
            to: from,
            message: RaftMessage::AppendResponse {
                term: self.hard.term,
                success: true,
                match_index: batch_end,
                append_index: self.log.latest_index(),
            },
        }])
    }

    fn handle_append_response(
        &mut self,
        from: MemberId,
        term: Term,
        success: bool,
        match_index: LogIndex,
        append_index: LogIndex,
        now: Instant,
    ) -> ConsensusResult<Vec<Outbound>> {
        if term > self.hard.term {
            self.become_follower(term, None)?;
            return Ok(Vec::new());
        }
        if term < self.hard.term {
            return Ok(Vec::new()); // stale: from an earlier leadership
        }

        let oldest_available = self.log.oldest_available_index();
        let log_latest = self.log.latest_index();

        let RoleState::Leader(leader) = &mut self.role else {
            return Ok(Vec::new()); // stale: stepped down since
        };
        let Some(progress) = leader.progress.get_mut(&from) else {
            return Ok(Vec::new()); // no longer a replication target
        };

        progress.last_ack = Some(now);

        if success {
            if match_index > progress.match_index {
                progress.match_index = match_index;
            }
            progress.next_index = progress.match_index + 1;
            progress.notified_compaction = false;
            let peer_match = progress.match_index;

            self.advance_commit();

            // A pending member whose log reached the commit point has
            // caught up; promote it into the voting set
            if self.commit_index > 0
                && peer_match >= self.commit_index
                && self.membership.pending_members().contains(&from)
            {
                if let Ok(next) = self.membership.prepare_promote(from) {
                    info!("Promoting caught-up member {} into the voting set", from);
                    let (_, outbound) = self.submit(Payload::Configuration(next))?;
                    return Ok(outbound);
                }
            }

            // Keep shipping if the peer is still behind
            if let Some(outbound) = self.build_append_for(from) {
                if !matches!(
                    outbound.message,
                    RaftMessage::AppendRequest { ref entries, .. } if entries.is_empty()
                ) {
                    return Ok(vec![outbound]);
                }
            }
            return Ok(Vec::new());
        }

        // Consistency check failed: walk back using the peer's last
        // known index and retry
        let fallback = progress.next_index.saturating_sub(1).min(append_index + 1);
        progress.next_index = fallback.max(1);

        if progress.next_index < oldest_available {
            // The peer needs entries we have pruned; incremental
            // replication cannot repair it
            progress.next_index = oldest_available;
            if !progress.notified_compaction {
                progress.notified_compaction = true;
                warn!(
                    "Peer {} diverged past the retained log (needs < {}), directing it to snapshot catch-up",
                    from, oldest_available
                );
                return Ok(vec![Outbound {
                    to: from,
                    message: RaftMessage::CompactionNotice {
                        leader_term: self.hard.term,
                        oldest_index: oldest_available,
                    },
                }]);
            }
            return Ok(Vec::new());
        }

        debug!(
            "Append to {} rejected; retrying from index {} (log latest {})",
            from, progress.next_index, log_latest
        );
        Ok(self.build_append_for(from).into_iter().collect())
    }

    fn handle_compaction_notice(
        &mut self,
        from: MemberId,
        leader_term: Term,
        oldest_index: LogIndex,
    ) -> ConsensusResult<Vec<Outbound>> {
        if leader_term < self.hard.term {
            return Ok(Vec::new());
        }
        self.become_follower(leader_term, Some(from))?;

        info!(
            "Leader {} pruned past our log (oldest retained {}); snapshot catch-up required",
            from, oldest_index
        );
        self.catchup_needed = Some(CatchupNeeded {
            source: from,
            oldest_index,
        });
        Ok(Vec::new())
    }

    // ---- leader duties ---------------------------------------------------

    /// Heartbeat tick: ship entries (or empty heartbeats), verify the
    /// leader lease, and honor the refuse-to-be-leader flag.
    pub fn on_heartbeat_tick(&mut self, now: Instant) -> ConsensusResult<Vec<Outbound>> {
        let RoleState::Leader(leader) = &self.role else {
            return Ok(Vec::new());
        };

        if self.config.refuse_to_be_leader && self.membership.active().voting.len() > 1 {
            warn!("Refusing member holds leadership; stepping down");
            self.become_follower(self.hard.term, None)?;
            return Ok(Vec::new());
        }

        // A leader that cannot reach a majority within the lease
        // window steps down instead of serving stale writes
        let grace_expired = now.duration_since(leader.since) >= self.config.leader_lease();
        if grace_expired && !self.lease_satisfied(leader, now) {
            warn!(
                "{} lost contact with a majority within the lease window; stepping down",
                self.id
            );
            self.become_follower(self.hard.term, None)?;
            return Ok(Vec::new());
        }

        Ok(self.build_all_appends())
    }

    fn lease_satisfied(&self, leader: &LeaderState, now: Instant) -> bool {
        let lease = self.config.leader_lease();
        let voting = &self.membership.active().voting;

        let mut reachable = 0;
        for member in voting {
            if *member == self.id {
                reachable += 1; // ourselves
                continue;
            }
            if let Some(progress) = leader.progress.get(member) {
                if let Some(ack) = progress.last_ack {
                    if now.duration_since(ack) < lease {
                        reachable += 1;
                    }
                }
            }
        }

        reachable >= self.membership.quorum()
    }

    /// Accept a client submission; only the leader may append.
    pub fn submit(&mut self, payload: Payload) -> ConsensusResult<(LogIndex, Vec<Outbound>)> {
        if !matches!(self.role, RoleState::Leader(_)) {
            return Err(ConsensusError::NotLeader {
                leader_hint: self.leader_hint(),
            });
        }

        let index = self.log.latest_index() + 1;
        let is_configuration = matches!(payload, Payload::Configuration(_));
        let entry = LogEntry {
            index,
            term: self.hard.term,
            payload,
        };

        if let Payload::Configuration(config) = &entry.payload {
            self.membership.on_append(index, config.clone());
        }
        self.log.append(entry)?;

        if is_configuration {
            self.refresh_progress(self.clock.now());
        }

        debug!("Accepted submission at index {} (term {})", index, self.hard.term);

        // Single-member clusters commit on local durability alone
        self.advance_commit();

        Ok((index, self.build_all_appends()))
    }

    /// Advance the commit index to the highest entry of the current
    /// term durably replicated on a majority of the voting set.
    fn advance_commit(&mut self) -> bool {
        let voting: Vec<MemberId> = self.membership.active().voting.iter().copied().collect();
        let RoleState::Leader(leader) = &self.role else {
            return false;
        };

        let mut match_indexes: Vec<LogIndex> = voting
            .iter()
            .map(|member| {
                if *member == self.id {
                    self.log.latest_index()
                } else {
                    leader
                        .progress
                        .get(member)
                        .map(|p| p.match_index)
                        .unwrap_or(0)
                }
            })
            .collect();

        if match_indexes.is_empty() {
            return false;
        }
        match_indexes.sort_unstable();
        let majority_match = match_indexes[(match_indexes.len() + 1) / 2 - 1];

        // Entries from earlier terms are only committed transitively,
        // never by counting replicas directly
        if majority_match > self.commit_index
            && self.log.entry_term(majority_match) == Some(self.hard.term)
        {
            debug!(
                "Commit index advanced {} -> {}",
                self.commit_index, majority_match
            );
            self.commit_index = majority_match;
            self.membership.on_commit(majority_match);

            // A leader that just committed its own removal steps down
            if !self.membership.active().contains(&self.id) {
                info!("{} removed from the voting set; stepping down", self.id);
                let _ = self.become_follower(self.hard.term, None);
            }
            return true;
        }
        false
    }

    /// (Re)build per-peer replication state from the active voting
    /// configuration. Pending members are replicated to but do not
    /// count toward quorums until caught up.
    fn refresh_progress(&mut self, now: Instant) {
        let targets: Vec<MemberId> = self
            .membership
            .active()
            .replication_targets()
            .into_iter()
            .filter(|member| *member != self.id)
            .collect();
        let next_index = self.log.latest_index() + 1;

        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };

        leader
            .progress
            .retain(|member, _| targets.contains(member));
        for member in targets {
            leader.progress.entry(member).or_insert(FollowerProgress {
                next_index,
                match_index: 0,
                last_ack: Some(now),
                notified_compaction: false,
            });
        }
    }

    fn build_all_appends(&self) -> Vec<Outbound> {
        let RoleState::Leader(leader) = &self.role else {
            return Vec::new();
        };
        leader
            .progress
            .keys()
            .filter_map(|member| self.build_append_for(*member))
            .collect()
    }

    /// Append batch (or empty heartbeat) for one peer, from its next
    /// expected index.
    fn build_append_for(&self, member: MemberId) -> Option<Outbound> {
        let RoleState::Leader(leader) = &self.role else {
            return None;
        };
        let progress = leader.progress.get(&member)?;

        let next = progress.next_index.max(self.log.oldest_available_index());
        let prev_log_index = next - 1;
        let prev_log_term = self.log.entry_term(prev_log_index)?;

        let latest = self.log.latest_index();
        let entries = if next > latest {
            Vec::new()
        } else {
            let end = latest.min(next + self.config.max_append_batch as u64 - 1);
            self.log.read_range(next, end).ok()?
        };

        Some(Outbound {
            to: member,
            message: RaftMessage::AppendRequest {
                leader_term: self.hard.term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::raft_log::{FsyncMode, LogStoreConfig, PruneStrategy};
    use tempfile::TempDir;

    struct Fixture {
        state: RaftState,
        clock: Arc<ManualClock>,
        peers: Vec<MemberId>,
        _dir: TempDir,
    }

    fn fixture(n_peers: usize) -> Fixture {
        fixture_with(n_peers, ConsensusConfig {
            pre_vote: false,
            ..ConsensusConfig::default()
        })
    }

    fn fixture_with(n_peers: usize, config: ConsensusConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let id = MemberId::new();
        let peers: Vec<MemberId> = (0..n_peers).map(|_| MemberId::new()).collect();

        let log = Arc::new(
            SegmentedLog::open(LogStoreConfig {
                directory: dir.path().join("raft"),
                segment_size_bytes: 512, // rotate early so pruning has segments to drop
                fsync_mode: FsyncMode::Never,
                fsync_interval_ms: 1000,
                prune_strategy: PruneStrategy::KeepNone,
            })
            .unwrap(),
        );

        let clock = Arc::new(ManualClock::new());
        let members = std::iter::once(id).chain(peers.iter().copied());
        let state = RaftState::new(
            id,
            config,
            ClusterConfiguration::new(members, 1),
            log,
            clock.clone(),
            dir.path(),
        )
        .unwrap();

        Fixture {
            state,
            clock,
            peers,
            _dir: dir,
        }
    }

    fn drive_to_leader(fx: &mut Fixture) {
        let now = fx.clock.now();
        let outbound = fx.state.on_election_timeout().unwrap();
        assert!(!outbound.is_empty() || fx.peers.is_empty());
        let term = fx.state.hard.term;
        let quorum = fx.state.membership.quorum();
        for peer in fx.peers.iter().take(quorum - 1) {
            fx.state
                .handle_message(
                    *peer,
                    RaftMessage::VoteResponse {
                        term,
                        granted: true,
                    },
                    now,
                )
                .unwrap();
        }
        assert_eq!(fx.state.role(), RaftRole::Leader);
    }

    #[test]
    fn test_single_vote_per_term() {
        let mut fx = fixture(2);
        let now = fx.clock.now();
        let (a, b) = (fx.peers[0], fx.peers[1]);

        let reply = fx
            .state
            .handle_message(
                a,
                RaftMessage::VoteRequest {
                    term: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                },
                now,
            )
            .unwrap();
        assert!(matches!(
            reply[0].message,
            RaftMessage::VoteResponse { granted: true, .. }
        ));

        // Second candidate in the same term is refused
        let reply = fx
            .state
            .handle_message(
                b,
                RaftMessage::VoteRequest {
                    term: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                },
                now,
            )
            .unwrap();
        assert!(matches!(
            reply[0].message,
            RaftMessage::VoteResponse { granted: false, .. }
        ));

        // But a later term gets a fresh vote
        let reply = fx
            .state
            .handle_message(
                b,
                RaftMessage::VoteRequest {
                    term: 2,
                    last_log_index: 0,
                    last_log_term: 0,
                },
                now,
            )
            .unwrap();
        assert!(matches!(
            reply[0].message,
            RaftMessage::VoteResponse { granted: true, .. }
        ));
    }

    #[test]
    fn test_vote_refused_to_stale_log() {
        let mut fx = fixture(2);
        let now = fx.clock.now();

        // Local log holds an entry of term 2
        fx.state.hard.term = 2;
        fx.state
            .log
            .append(LogEntry::command(1, 2, b"x".to_vec()))
            .unwrap();

        let reply = fx
            .state
            .handle_message(
                fx.peers[0],
                RaftMessage::VoteRequest {
                    term: 3,
                    last_log_index: 5,
                    last_log_term: 1, // older term at the tail
                },
                now,
            )
            .unwrap();
        assert!(matches!(
            reply[0].message,
            RaftMessage::VoteResponse { granted: false, .. }
        ));

        // A candidate with the same tail term but longer log wins
        let reply = fx
            .state
            .handle_message(
                fx.peers[1],
                RaftMessage::VoteRequest {
                    term: 3,
                    last_log_index: 2,
                    last_log_term: 2,
                },
                now,
            )
            .unwrap();
        assert!(matches!(
            reply[0].message,
            RaftMessage::VoteResponse { granted: true, .. }
        ));
    }

    #[test]
    fn test_pre_vote_mutates_nothing() {
        let mut fx = fixture(2);
        let now = fx.clock.now();

        let reply = fx
            .state
            .handle_message(
                fx.peers[0],
                RaftMessage::PreVoteRequest {
                    term: 5,
                    last_log_index: 0,
                    last_log_term: 0,
                },
                now,
            )
            .unwrap();

        assert!(matches!(
            reply[0].message,
            RaftMessage::PreVoteResponse { granted: true, .. }
        ));
        assert_eq!(fx.state.hard.term, 0);
        assert_eq!(fx.state.hard.voted_for, None);
    }

    #[test]
    fn test_pre_vote_round_precedes_election() {
        let mut fx = fixture_with(2, ConsensusConfig::default());
        let now = fx.clock.now();

        let outbound = fx.state.on_election_timeout().unwrap();
        assert!(outbound
            .iter()
            .all(|o| matches!(o.message, RaftMessage::PreVoteRequest { .. })));
        assert_eq!(fx.state.hard.term, 0, "pre-vote must not bump the term");

        // One positive pre-vote completes the majority (2 of 3)
        let outbound = fx
            .state
            .handle_message(
                fx.peers[0],
                RaftMessage::PreVoteResponse {
                    term: 0,
                    granted: true,
                },
                now,
            )
            .unwrap();

        assert_eq!(fx.state.role(), RaftRole::Candidate);
        assert_eq!(fx.state.hard.term, 1);
        assert!(outbound
            .iter()
            .all(|o| matches!(o.message, RaftMessage::VoteRequest { term: 1, .. })));
    }

    #[test]
    fn test_candidate_becomes_leader_on_majority() {
        let mut fx = fixture(2);
        drive_to_leader(&mut fx);
        assert_eq!(fx.state.hard.term, 1);
    }

    #[test]
    fn test_refusing_member_never_stands() {
        let mut fx = fixture_with(2, ConsensusConfig {
            pre_vote: false,
            refuse_to_be_leader: true,
            ..ConsensusConfig::default()
        });
        let now = fx.clock.now();

        assert!(fx.state.on_election_timeout().unwrap().is_empty());
        assert_eq!(fx.state.role(), RaftRole::Follower);

        // It still grants votes
        let reply = fx
            .state
            .handle_message(
                fx.peers[0],
                RaftMessage::VoteRequest {
                    term: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                },
                now,
            )
            .unwrap();
        assert!(matches!(
            reply[0].message,
            RaftMessage::VoteResponse { granted: true, .. }
        ));
    }

    #[test]
    fn test_leader_steps_down_on_higher_term() {
        let mut fx = fixture(2);
        let now = fx.clock.now();
        drive_to_leader(&mut fx);

        fx.state
            .handle_message(
                fx.peers[0],
                RaftMessage::AppendResponse {
                    term: 9,
                    success: false,
                    match_index: 0,
                    append_index: 0,
                },
                now,
            )
            .unwrap();

        assert_eq!(fx.state.role(), RaftRole::Follower);
        assert_eq!(fx.state.hard.term, 9);
    }

    #[test]
    fn test_commit_requires_current_term_entry() {
        let mut fx = fixture(2);
        let now = fx.clock.now();

        // An entry from an old term sits uncommitted in the log
        fx.state.hard.term = 1;
        fx.state
            .log
            .append(LogEntry::command(1, 1, b"old".to_vec()))
            .unwrap();

        fx.state.hard.term = 2;
        fx.state.role = RoleState::Leader(LeaderState {
            progress: HashMap::new(),
            since: now,
        });
        fx.state.refresh_progress(now);
        // Barrier entry of the current term
        fx.state
            .log
            .append(LogEntry {
                index: 2,
                term: 3,
                payload: Payload::Noop,
            })
            .unwrap();
        fx.state.hard.term = 3;

        // Majority matches index 1 only: the old-term entry must not
        // commit by counting
        let leader_progress = match &mut fx.state.role {
            RoleState::Leader(l) => l,
            _ => unreachable!(),
        };
        for peer in &fx.peers {
            leader_progress.progress.get_mut(peer).unwrap().match_index = 1;
        }
        assert!(!fx.state.advance_commit());
        assert_eq!(fx.state.commit_index, 0);

        // Once the barrier replicates, everything beneath commits too
        let leader_progress = match &mut fx.state.role {
            RoleState::Leader(l) => l,
            _ => unreachable!(),
        };
        leader_progress
            .progress
            .get_mut(&fx.peers[0])
            .unwrap()
            .match_index = 2;
        assert!(fx.state.advance_commit());
        assert_eq!(fx.state.commit_index, 2);
    }

    #[test]
    fn test_follower_truncates_diverging_suffix() {
        let mut fx = fixture(2);
        let now = fx.clock.now();
        let leader = fx.peers[0];

        // Local log diverged in term 1
        fx.state
            .log
            .append_batch(vec![
                LogEntry::command(1, 1, b"a".to_vec()),
                LogEntry::command(2, 1, b"stale-b".to_vec()),
                LogEntry::command(3, 1, b"stale-c".to_vec()),
            ])
            .unwrap();

        // The term-2 leader replaces everything from index 2
        let reply = fx
            .state
            .handle_message(
                leader,
                RaftMessage::AppendRequest {
                    leader_term: 2,
                    prev_log_index: 1,
                    prev_log_term: 1,
                    entries: vec![
                        LogEntry::command(2, 2, b"b".to_vec()),
                        LogEntry::command(3, 2, b"c".to_vec()),
                    ],
                    leader_commit: 1,
                },
                now,
            )
            .unwrap();

        assert!(matches!(
            reply[0].message,
            RaftMessage::AppendResponse {
                success: true,
                match_index: 3,
                ..
            }
        ));
        assert_eq!(fx.state.log.entry_term(2), Some(2));
        assert_eq!(fx.state.log.entry_term(3), Some(2));
        assert_eq!(fx.state.commit_index, 1);
    }

    #[test]
    fn test_duplicate_append_replay_is_idempotent() {
        let mut fx = fixture(2);
        let now = fx.clock.now();
        let leader = fx.peers[0];

        let request = RaftMessage::AppendRequest {
            leader_term: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry::command(1, 1, b"a".to_vec()),
                LogEntry::command(2, 1, b"b".to_vec()),
            ],
            leader_commit: 0,
        };

        for _ in 0..3 {
            let reply = fx
                .state
                .handle_message(leader, request.clone(), now)
                .unwrap();
            assert!(matches!(
                reply[0].message,
                RaftMessage::AppendResponse {
                    success: true,
                    match_index: 2,
                    ..
                }
            ));
        }

        assert_eq!(fx.state.log.latest_index(), 2);
        assert_eq!(
            fx.state.log.read_range(1, 2).unwrap()[1].payload,
            Payload::Command(b"b".to_vec())
        );
    }

    #[test]
    fn test_append_mismatch_reports_walk_back_hint() {
        let mut fx = fixture(2);
        let now = fx.clock.now();
        let leader = fx.peers[0];

        fx.state
            .log
            .append(LogEntry::command(1, 1, b"a".to_vec()))
            .unwrap();

        let reply = fx
            .state
            .handle_message(
                leader,
                RaftMessage::AppendRequest {
                    leader_term: 2,
                    prev_log_index: 7,
                    prev_log_term: 2,
                    entries: Vec::new(),
                    leader_commit: 0,
                },
                now,
            )
            .unwrap();

        match reply[0].message {
            RaftMessage::AppendResponse {
                success,
                append_index,
                ..
            } => {
                assert!(!success);
                assert_eq!(append_index, 1);
            }
            _ => panic!("expected append response"),
        }
    }

    #[test]
    fn test_leader_lease_step_down() {
        let mut fx = fixture(2);
        drive_to_leader(&mut fx);

        // Nothing acked for longer than the lease window
        fx.clock
            .advance(Duration::from_millis(fx.state.config.election_timeout_max_ms * 2));
        let now = fx.clock.now();

        fx.state.on_heartbeat_tick(now).unwrap();
        assert_eq!(fx.state.role(), RaftRole::Follower);
    }

    #[test]
    fn test_leader_keeps_lease_with_acked_majority() {
        let mut fx = fixture(2);
        drive_to_leader(&mut fx);
        let term = fx.state.hard.term;

        fx.clock.advance(Duration::from_millis(400));
        let now = fx.clock.now();

        // One of two peers still acks: 2 of 3 reachable
        fx.state
            .handle_message(
                fx.peers[0],
                RaftMessage::AppendResponse {
                    term,
                    success: true,
                    match_index: 1,
                    append_index: 1,
                },
                now,
            )
            .unwrap();

        fx.clock.advance(Duration::from_millis(300));
        let now = fx.clock.now();
        fx.state.on_heartbeat_tick(now).unwrap();
        assert_eq!(fx.state.role(), RaftRole::Leader);
    }

    #[test]
    fn test_submit_rejected_on_follower() {
        let mut fx = fixture(2);
        let now = fx.clock.now();

        // Learn about a leader first
        fx.state
            .handle_message(
                fx.peers[0],
                RaftMessage::AppendRequest {
                    leader_term: 1,
                    prev_log_index: 0,
                    prev_log_term: 0,
                    entries: Vec::new(),
                    leader_commit: 0,
                },
                now,
            )
            .unwrap();

        let result = fx.state.submit(Payload::Command(b"write".to_vec()));
        match result {
            Err(ConsensusError::NotLeader { leader_hint }) => {
                assert_eq!(leader_hint, Some(fx.peers[0]));
            }
            other => panic!("expected NotLeader, got {:?}", other.map(|(i, _)| i)),
        }
    }

    #[test]
    fn test_leader_directs_pruned_follower_to_catchup() {
        let mut fx = fixture(2);
        drive_to_leader(&mut fx);
        let term = fx.state.hard.term;
        let now = fx.clock.now();

        // Build up and prune the log so early entries are gone
        for index in 2..=30 {
            fx.state
                .log
                .append(LogEntry::command(index, term, vec![0u8; 64]))
                .unwrap();
        }
        fx.state.commit_index = 30;
        fx.state.log.prune(30).unwrap();
        assert!(fx.state.log.oldest_available_index() > 1);

        // Peer reports a log far behind the retained window
        let outbound = fx
            .state
            .handle_message(
                fx.peers[0],
                RaftMessage::AppendResponse {
                    term,
                    success: false,
                    match_index: 0,
                    append_index: 0,
                },
                now,
            )
            .unwrap();

        assert!(matches!(
            outbound[0].message,
            RaftMessage::CompactionNotice { .. }
        ));
    }

    #[test]
    fn test_follower_flags_catchup_on_compaction_notice() {
        let mut fx = fixture(2);
        let now = fx.clock.now();
        let leader = fx.peers[0];

        fx.state
            .handle_message(
                leader,
                RaftMessage::CompactionNotice {
                    leader_term: 3,
                    oldest_index: 100,
                },
                now,
            )
            .unwrap();

        let needed = fx.state.take_catchup_needed().unwrap();
        assert_eq!(needed.source, leader);
        assert_eq!(needed.oldest_index, 100);
        assert_eq!(fx.state.hard.term, 3);
    }

    #[test]
    fn test_membership_change_through_log() {
        let mut fx = fixture(2);
        drive_to_leader(&mut fx);
        let now = fx.clock.now();
        let term = fx.state.hard.term;

        // Commit the barrier first
        for peer in &fx.peers {
            fx.state
                .handle_message(
                    *peer,
                    RaftMessage::AppendResponse {
                        term,
                        success: true,
                        match_index: 1,
                        append_index: 1,
                    },
                    now,
                )
                .unwrap();
        }
        assert_eq!(fx.state.commit_index, 1);

        // Append a configuration adding a fourth member
        let newcomer = MemberId::new();
        let next = fx.state.membership.prepare_add(newcomer).unwrap();
        let (index, outbound) = fx.state.submit(Payload::Configuration(next)).unwrap();
        assert_eq!(index, 2);
        // The new member immediately becomes a replication target
        assert!(outbound.iter().any(|o| o.to == newcomer));

        // But holds no vote while pending
        assert_eq!(fx.state.membership.active().voting.len(), 3);
        assert!(fx.state.membership.pending_members().contains(&newcomer));

        // Existing peers replicate and commit the addition
        for peer in fx.peers.clone() {
            fx.state
                .handle_message(
                    peer,
                    RaftMessage::AppendResponse {
                        term,
                        success: true,
                        match_index: 2,
                        append_index: 2,
                    },
                    now,
                )
                .unwrap();
        }
        assert_eq!(fx.state.commit_index, 2);

        // Once the newcomer reports a caught-up log, the leader
        // appends the promotion entry
        let outbound = fx
            .state
            .handle_message(
                newcomer,
                RaftMessage::AppendResponse {
                    term,
                    success: true,
                    match_index: 2,
                    append_index: 2,
                },
                now,
            )
            .unwrap();
        assert!(!outbound.is_empty());
        assert_eq!(fx.state.membership.active().voting.len(), 4);
        assert!(fx.state.membership.pending_members().is_empty());

        // The promotion entry commits like any other
        for peer in fx.peers.clone() {
            fx.state
                .handle_message(
                    peer,
                    RaftMessage::AppendResponse {
                        term,
                        success: true,
                        match_index: 3,
                        append_index: 3,
                    },
                    now,
                )
                .unwrap();
        }
        assert_eq!(fx.state.commit_index, 3);
        assert_eq!(fx.state.membership.committed().voting.len(), 4);
    }
}
