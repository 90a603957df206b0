//! Upstream selection
//!
//! Maps a replica to the member it should pull from. Strategies are
//! tried in order until one yields a member; deployments compose them
//! (a preferred member, then the replica's server group, then any
//! reachable core).

use crate::consensus::MemberId;
use crate::topology::{MemberInfo, MemberRole};
use rand::seq::SliceRandom;
use std::collections::HashMap;

/// One upstream selection strategy.
pub trait ChooseUpstream: Send + Sync {
    fn choose(
        &self,
        self_id: MemberId,
        members: &HashMap<MemberId, MemberInfo>,
    ) -> Option<MemberId>;
}

/// Always pull from one specific member when it is present.
pub struct PreferredMember(pub MemberId);

impl ChooseUpstream for PreferredMember {
    fn choose(
        &self,
        self_id: MemberId,
        members: &HashMap<MemberId, MemberInfo>,
    ) -> Option<MemberId> {
        if self.0 != self_id && members.contains_key(&self.0) {
            Some(self.0)
        } else {
            None
        }
    }
}

/// Pull from any member sharing a server group (core or replica).
pub struct ServerGroup(pub String);

impl ChooseUpstream for ServerGroup {
    fn choose(
        &self,
        self_id: MemberId,
        members: &HashMap<MemberId, MemberInfo>,
    ) -> Option<MemberId> {
        let candidates: Vec<MemberId> = members
            .iter()
            .filter(|(id, info)| **id != self_id && info.groups.contains(&self.0))
            .map(|(id, _)| *id)
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }
}

/// Fallback: any reachable core member.
pub struct AnyCoreMember;

impl ChooseUpstream for AnyCoreMember {
    fn choose(
        &self,
        self_id: MemberId,
        members: &HashMap<MemberId, MemberInfo>,
    ) -> Option<MemberId> {
        let candidates: Vec<MemberId> = members
            .iter()
            .filter(|(id, info)| **id != self_id && info.role == MemberRole::Core)
            .map(|(id, _)| *id)
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }
}

/// Walk the strategy chain.
pub(crate) fn select_upstream(
    strategies: &[Box<dyn ChooseUpstream>],
    self_id: MemberId,
    members: &HashMap<MemberId, MemberInfo>,
) -> Option<MemberId> {
    strategies
        .iter()
        .find_map(|strategy| strategy.choose(self_id, members))
}
