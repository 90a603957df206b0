//! In-process transport for multi-node tests
//!
//! Routes messages between registered members over channels, with
//! partition and crash controls so election and replication scenarios
//! run without sockets.

use super::{RaftTransport, TransportError, TransportResult};
use crate::consensus::{MemberId, RaftMessage};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

type Inbox = mpsc::UnboundedSender<(MemberId, RaftMessage)>;

/// Shared router; one per simulated cluster.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inboxes: Arc<RwLock<HashMap<MemberId, Inbox>>>,
    /// Directed pairs whose traffic is dropped.
    blocked: Arc<RwLock<HashSet<(MemberId, MemberId)>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a member; returns its transport handle and the stream of
    /// messages addressed to it.
    pub fn register(
        &self,
        id: MemberId,
    ) -> (
        Arc<MemoryTransport>,
        mpsc::UnboundedReceiver<(MemberId, RaftMessage)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(id, tx);

        let transport = Arc::new(MemoryTransport {
            network: self.clone(),
            from: id,
        });
        (transport, rx)
    }

    /// Simulate a crash: the member stops receiving anything.
    pub fn disconnect(&self, id: MemberId) {
        self.inboxes.write().remove(&id);
    }

    /// Drop all traffic between two members, both directions.
    pub fn block(&self, a: MemberId, b: MemberId) {
        let mut blocked = self.blocked.write();
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    /// Restore traffic between two members.
    pub fn heal(&self, a: MemberId, b: MemberId) {
        let mut blocked = self.blocked.write();
        blocked.remove(&(a, b));
        blocked.remove(&(b, a));
    }

    fn deliver(&self, from: MemberId, to: MemberId, message: RaftMessage) -> TransportResult<()> {
        if self.blocked.read().contains(&(from, to)) {
            debug!("Dropping {} -> {} (partitioned)", from, to);
            return Ok(());
        }

        let inboxes = self.inboxes.read();
        let Some(inbox) = inboxes.get(&to) else {
            return Err(TransportError::UnknownMember(to));
        };
        inbox
            .send((from, message))
            .map_err(|_| TransportError::Shutdown)
    }
}

/// Per-member handle into a `MemoryNetwork`.
pub struct MemoryTransport {
    network: MemoryNetwork,
    from: MemberId,
}

#[async_trait]
impl RaftTransport for MemoryTransport {
    async fn send(&self, to: MemberId, message: RaftMessage) -> TransportResult<()> {
        self.network.deliver(self.from, to, message)
    }
}
