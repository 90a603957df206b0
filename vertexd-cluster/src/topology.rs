//! Cluster topology view
//!
//! The discovery subsystem resolves member identities to addresses and
//! roles; this core only consumes that mapping. `TopologyView` is the
//! narrow read-only interface it is consumed through, refreshed by the
//! caller, never mutated from here.

use crate::consensus::MemberId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Role a member plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Voting participant in consensus.
    Core,
    /// Non-voting member that pulls committed data asynchronously.
    ReadReplica,
}

/// Addressing and role information for one member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Consensus RPC address.
    pub address: SocketAddr,
    /// Catch-up protocol address (transaction pull and store copy).
    pub catchup_address: SocketAddr,
    /// Voting core member or read replica.
    pub role: MemberRole,
    /// Operator-assigned server groups, used for upstream selection.
    pub groups: Vec<String>,
}

impl MemberInfo {
    pub fn core(address: SocketAddr, catchup_address: SocketAddr) -> Self {
        Self {
            address,
            catchup_address,
            role: MemberRole::Core,
            groups: Vec::new(),
        }
    }

    pub fn read_replica(address: SocketAddr, catchup_address: SocketAddr) -> Self {
        Self {
            address,
            catchup_address,
            role: MemberRole::ReadReplica,
            groups: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    pub fn is_core(&self) -> bool {
        self.role == MemberRole::Core
    }
}

/// Read-only view of the current member roster.
pub trait TopologyView: Send + Sync {
    /// Current roster, member id to address and role.
    fn members(&self) -> HashMap<MemberId, MemberInfo>;

    /// Lookup a single member.
    fn lookup(&self, member: &MemberId) -> Option<MemberInfo> {
        self.members().get(member).cloned()
    }
}

/// Static topology backed by a shared map.
///
/// Used by deployments with a fixed roster and throughout the test
/// suites; the discovery subsystem provides its own implementation in
/// production.
#[derive(Clone, Default)]
pub struct FixedTopology {
    members: Arc<RwLock<HashMap<MemberId, MemberInfo>>>,
}

impl FixedTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, member: MemberId, info: MemberInfo) {
        self.members.write().insert(member, info);
    }

    pub fn remove(&self, member: &MemberId) {
        self.members.write().remove(member);
    }
}

impl TopologyView for FixedTopology {
    fn members(&self) -> HashMap<MemberId, MemberInfo> {
        self.members.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn fixed_topology_roster() {
        let topology = FixedTopology::new();
        let core = MemberId::new();
        let replica = MemberId::new();

        topology.insert(core, MemberInfo::core(addr(7000), addr(7100)));
        topology.insert(replica, MemberInfo::read_replica(addr(7001), addr(7101)));

        let members = topology.members();
        assert_eq!(members.len(), 2);
        assert!(members[&core].is_core());
        assert!(!members[&replica].is_core());

        topology.remove(&core);
        assert!(topology.lookup(&core).is_none());
    }
}
