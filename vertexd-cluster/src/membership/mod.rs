//! Voting-set membership
//!
//! Membership changes travel through the replicated log as specially
//! tagged entries, so every member observes them in the same total
//! order as data. Additions are two-phase: a new member first enters
//! the configuration as *pending* (replicated to, but holding no
//! vote), and the leader appends a second configuration entry
//! promoting it once its log has caught up. Both phases commit under
//! the same rules as data, so every member derives the same quorum at
//! every log position.
//!
//! The manager tracks the last committed and the last appended
//! (possibly still uncommitted) configuration; quorum arithmetic
//! follows the latest appended one, so an in-flight change is honored
//! consistently by the leader that appended it.

use crate::consensus::{LogIndex, MemberId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The voting set plus pending additions and the minimum-size policy,
/// replicated as a log entry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    /// Voting core members.
    pub voting: BTreeSet<MemberId>,
    /// Members being added: replicated to, no vote yet.
    pub pending: BTreeSet<MemberId>,
    /// The voting set must never shrink below this via a single change.
    pub min_core_size: usize,
}

impl ClusterConfiguration {
    pub fn new(voting: impl IntoIterator<Item = MemberId>, min_core_size: usize) -> Self {
        Self {
            voting: voting.into_iter().collect(),
            pending: BTreeSet::new(),
            min_core_size,
        }
    }

    pub fn contains(&self, member: &MemberId) -> bool {
        self.voting.contains(member) || self.pending.contains(member)
    }

    /// Every member the leader replicates to.
    pub fn replication_targets(&self) -> BTreeSet<MemberId> {
        self.voting.union(&self.pending).copied().collect()
    }

    /// More than half of the voting set.
    pub fn quorum(&self) -> usize {
        self.voting.len() / 2 + 1
    }
}

/// Membership error types
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("member {0} is already part of the configuration")]
    AlreadyMember(MemberId),

    #[error("member {0} is not part of the configuration")]
    UnknownMember(MemberId),

    #[error("member {0} is not pending promotion")]
    NotPending(MemberId),

    #[error("removal would shrink the voting set to {would_be}, below the minimum of {minimum}")]
    BelowMinimumSize { would_be: usize, minimum: usize },

    #[error("a membership change is already in flight at index {0}")]
    ChangeInFlight(LogIndex),
}

pub type MembershipResult<T> = std::result::Result<T, MembershipError>;

/// Tracks the voting configuration as it moves through the log.
#[derive(Debug, Clone)]
pub struct MembershipManager {
    /// Last configuration known committed.
    committed: ClusterConfiguration,
    /// Last appended configuration and the index it sits at, when it
    /// differs from the committed one.
    appended: Option<(LogIndex, ClusterConfiguration)>,
}

impl MembershipManager {
    pub fn new(initial: ClusterConfiguration) -> Self {
        Self {
            committed: initial,
            appended: None,
        }
    }

    /// Configuration governing quorum arithmetic: the latest appended
    /// one when a change is in flight, the committed one otherwise.
    pub fn active(&self) -> &ClusterConfiguration {
        match &self.appended {
            Some((_, config)) => config,
            None => &self.committed,
        }
    }

    pub fn committed(&self) -> &ClusterConfiguration {
        &self.committed
    }

    /// Votes needed for a majority of the active voting set.
    pub fn quorum(&self) -> usize {
        self.active().quorum()
    }

    /// Members replicated to but not yet voting.
    pub fn pending_members(&self) -> &BTreeSet<MemberId> {
        &self.active().pending
    }

    fn reject_if_change_in_flight(&self) -> MembershipResult<()> {
        match &self.appended {
            Some((index, _)) => Err(MembershipError::ChangeInFlight(*index)),
            None => Ok(()),
        }
    }

    /// Validate an addition and produce the configuration entry
    /// payload. The member joins as pending: replicated to, no vote.
    pub fn prepare_add(&self, member: MemberId) -> MembershipResult<ClusterConfiguration> {
        self.reject_if_change_in_flight()?;
        if self.active().contains(&member) {
            return Err(MembershipError::AlreadyMember(member));
        }

        let mut next = self.active().clone();
        next.pending.insert(member);
        Ok(next)
    }

    /// Validate a promotion of a caught-up pending member into the
    /// voting set.
    pub fn prepare_promote(&self, member: MemberId) -> MembershipResult<ClusterConfiguration> {
        self.reject_if_change_in_flight()?;
        if !self.active().pending.contains(&member) {
            return Err(MembershipError::NotPending(member));
        }

        let mut next = self.active().clone();
        next.pending.remove(&member);
        next.voting.insert(member);
        Ok(next)
    }

    /// Validate a removal and produce the configuration entry payload.
    ///
    /// A removal that would drop the voting set below the configured
    /// floor is rejected; the configuration remains unchanged.
    pub fn prepare_remove(&self, member: MemberId) -> MembershipResult<ClusterConfiguration> {
        self.reject_if_change_in_flight()?;

        let mut next = self.active().clone();
        if next.pending.remove(&member) {
            return Ok(next); // abandoning a pending member needs no floor check
        }
        if !next.voting.contains(&member) {
            return Err(MembershipError::UnknownMember(member));
        }

        let would_be = next.voting.len() - 1;
        if would_be < next.min_core_size {
            warn!(
                "Rejecting removal of {}: voting set would shrink to {} (minimum {})",
                member, would_be, next.min_core_size
            );
            return Err(MembershipError::BelowMinimumSize {
                would_be,
                minimum: next.min_core_size,
            });
        }

        next.voting.remove(&member);
        Ok(next)
    }

    /// A configuration entry was appended to the log (locally or via
    /// replication from the leader).
    pub fn on_append(&mut self, index: LogIndex, config: ClusterConfiguration) {
        debug!(
            "Membership change appended at index {}: {} voting, {} pending",
            index,
            config.voting.len(),
            config.pending.len()
        );
        self.appended = Some((index, config));
    }

    /// The commit index advanced; promote the appended configuration
    /// once it is covered.
    pub fn on_commit(&mut self, commit_index: LogIndex) {
        if let Some((index, config)) = &self.appended {
            if *index <= commit_index {
                info!(
                    "Membership change at index {} committed: {} voting, {} pending",
                    index,
                    config.voting.len(),
                    config.pending.len()
                );
                self.committed = config.clone();
                self.appended = None;
            }
        }
    }

    /// A suffix of the log was truncated to resolve a replication
    /// conflict; roll back any appended-but-uncommitted configuration
    /// that sat in the discarded range.
    pub fn on_truncate(&mut self, from_index: LogIndex) {
        if let Some((index, _)) = &self.appended {
            if *index >= from_index {
                warn!(
                    "Membership change at index {} truncated, reverting to committed configuration",
                    index
                );
                self.appended = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(n: usize) -> Vec<MemberId> {
        (0..n).map(|_| MemberId::new()).collect()
    }

    fn manager(ids: &[MemberId], min: usize) -> MembershipManager {
        MembershipManager::new(ClusterConfiguration::new(ids.iter().copied(), min))
    }

    #[test]
    fn test_quorum_arithmetic() {
        let ids = members(3);
        let m = manager(&ids, 3);
        assert_eq!(m.quorum(), 2);

        let ids = members(4);
        let m = manager(&ids, 3);
        assert_eq!(m.quorum(), 3);
    }

    #[test]
    fn test_removal_below_minimum_rejected() {
        let ids = members(3);
        let m = manager(&ids, 3);

        let result = m.prepare_remove(ids[0]);
        assert!(matches!(
            result,
            Err(MembershipError::BelowMinimumSize {
                would_be: 2,
                minimum: 3
            })
        ));
        // Configuration unchanged
        assert_eq!(m.active().voting.len(), 3);
    }

    #[test]
    fn test_removal_above_minimum_allowed() {
        let ids = members(4);
        let m = manager(&ids, 3);

        let next = m.prepare_remove(ids[0]).unwrap();
        assert_eq!(next.voting.len(), 3);
        assert!(!next.contains(&ids[0]));
    }

    #[test]
    fn test_addition_is_two_phase() {
        let ids = members(3);
        let mut m = manager(&ids, 3);
        let newcomer = MemberId::new();

        // Phase one: join as pending, no vote
        let next = m.prepare_add(newcomer).unwrap();
        m.on_append(10, next);
        assert!(m.pending_members().contains(&newcomer));
        assert!(m.active().replication_targets().contains(&newcomer));
        assert_eq!(m.quorum(), 2, "pending members hold no vote");

        m.on_commit(10);

        // Phase two: promotion into the voting set
        let next = m.prepare_promote(newcomer).unwrap();
        m.on_append(15, next);
        m.on_commit(15);

        assert!(m.active().voting.contains(&newcomer));
        assert!(m.pending_members().is_empty());
        assert_eq!(m.quorum(), 3);
    }

    #[test]
    fn test_promote_requires_pending() {
        let ids = members(3);
        let m = manager(&ids, 2);
        assert!(matches!(
            m.prepare_promote(ids[0]),
            Err(MembershipError::NotPending(_))
        ));
    }

    #[test]
    fn test_pending_member_can_be_abandoned() {
        let ids = members(3);
        let mut m = manager(&ids, 3);
        let newcomer = MemberId::new();

        let next = m.prepare_add(newcomer).unwrap();
        m.on_append(4, next);
        m.on_commit(4);

        // Dropping a pending member ignores the voting-set floor
        let next = m.prepare_remove(newcomer).unwrap();
        assert!(!next.contains(&newcomer));
        assert_eq!(next.voting.len(), 3);
    }

    #[test]
    fn test_single_change_in_flight() {
        let ids = members(3);
        let mut m = manager(&ids, 2);

        let next = m.prepare_add(MemberId::new()).unwrap();
        m.on_append(5, next);

        assert!(matches!(
            m.prepare_add(MemberId::new()),
            Err(MembershipError::ChangeInFlight(5))
        ));
        assert!(matches!(
            m.prepare_remove(ids[0]),
            Err(MembershipError::ChangeInFlight(5))
        ));
    }

    #[test]
    fn test_truncate_reverts_uncommitted_change() {
        let ids = members(3);
        let mut m = manager(&ids, 2);

        let next = m.prepare_remove(ids[2]).unwrap();
        m.on_append(8, next);
        assert_eq!(m.active().voting.len(), 2);

        m.on_truncate(8);
        assert_eq!(m.active().voting.len(), 3);
        assert!(m.active().contains(&ids[2]));
    }

    #[test]
    fn test_duplicate_add_and_unknown_remove_rejected() {
        let ids = members(3);
        let m = manager(&ids, 2);

        assert!(matches!(
            m.prepare_add(ids[0]),
            Err(MembershipError::AlreadyMember(_))
        ));
        assert!(matches!(
            m.prepare_remove(MemberId::new()),
            Err(MembershipError::UnknownMember(_))
        ));
    }
}
