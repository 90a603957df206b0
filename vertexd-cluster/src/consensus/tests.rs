//! Multi-member consensus scenarios over the in-process transport.

use super::*;
use crate::clock::SystemClock;
use crate::membership::ClusterConfiguration;
use crate::raft_log::{FsyncMode, LogStoreConfig, PruneStrategy, SegmentedLog};
use crate::state_machine::{InMemoryStateMachine, StoreId};
use crate::transport::MemoryNetwork;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

struct TestNode {
    id: MemberId,
    core: Arc<RaftCore>,
    adapter: Arc<InMemoryStateMachine>,
    _dir: TempDir,
}

struct TestCluster {
    network: MemoryNetwork,
    nodes: Vec<TestNode>,
    store_id: StoreId,
    initial: ClusterConfiguration,
}

fn fast_config() -> ConsensusConfig {
    ConsensusConfig {
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        heartbeat_interval_ms: 50,
        commit_timeout_ms: 5000,
        ..ConsensusConfig::default()
    }
}

fn spawn_node(
    network: &MemoryNetwork,
    id: MemberId,
    initial: ClusterConfiguration,
    config: ConsensusConfig,
    store_id: StoreId,
) -> TestNode {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(
        SegmentedLog::open(LogStoreConfig {
            directory: dir.path().join("raft"),
            segment_size_bytes: 64 * 1024,
            fsync_mode: FsyncMode::Never,
            fsync_interval_ms: 1000,
            prune_strategy: PruneStrategy::KeepNone,
        })
        .unwrap(),
    );
    let adapter = InMemoryStateMachine::with_store_id(store_id);
    let (transport, mut inbound) = network.register(id);

    let core = RaftCore::spawn(
        id,
        config,
        initial,
        log,
        adapter.clone(),
        transport,
        Arc::new(SystemClock),
        dir.path(),
    )
    .unwrap();

    let pump = Arc::clone(&core);
    tokio::spawn(async move {
        while let Some((from, message)) = inbound.recv().await {
            pump.deliver(from, message);
        }
    });

    TestNode {
        id,
        core,
        adapter,
        _dir: dir,
    }
}

impl TestCluster {
    fn new(n: usize, min_core_size: usize) -> Self {
        Self::with_config(n, min_core_size, |_| fast_config())
    }

    fn with_config(
        n: usize,
        min_core_size: usize,
        config_for: impl Fn(usize) -> ConsensusConfig,
    ) -> Self {
        let network = MemoryNetwork::new();
        let store_id = StoreId::generate();
        let ids: Vec<MemberId> = (0..n).map(|_| MemberId::new()).collect();
        let initial = ClusterConfiguration::new(ids.iter().copied(), min_core_size);

        let nodes = ids
            .iter()
            .enumerate()
            .map(|(position, id)| {
                spawn_node(
                    &network,
                    *id,
                    initial.clone(),
                    config_for(position),
                    store_id,
                )
            })
            .collect();

        Self {
            network,
            nodes,
            store_id,
            initial,
        }
    }

    /// Wait until exactly one live node reports leadership.
    async fn wait_for_leader(&self, exclude: &[MemberId]) -> usize {
        for _ in 0..200 {
            let leaders: Vec<usize> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| !exclude.contains(&node.id))
                .filter(|(_, node)| node.core.status().role == RaftRole::Leader)
                .map(|(position, _)| position)
                .collect();
            if leaders.len() == 1 {
                return leaders[0];
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("no unique leader elected within the deadline");
    }

    async fn shutdown(&self) {
        for node in &self.nodes {
            node.core.shutdown().await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_members_elect_exactly_one_leader() {
    let cluster = TestCluster::new(3, 3);
    let leader = cluster.wait_for_leader(&[]).await;

    // Observe for a while: no term may ever show two leaders
    let mut leaders_by_term: HashMap<Term, MemberId> = HashMap::new();
    for _ in 0..20 {
        for node in &cluster.nodes {
            let status = node.core.status();
            if status.role == RaftRole::Leader {
                let previous = leaders_by_term.insert(status.term, status.member_id);
                if let Some(previous) = previous {
                    assert_eq!(
                        previous, status.member_id,
                        "two leaders observed in term {}",
                        status.term
                    );
                }
            }
        }
        sleep(Duration::from_millis(25)).await;
    }

    let status = cluster.nodes[leader].core.status();
    assert!(status.quorum_reachable);
    assert_eq!(status.voting_members.len(), 3);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writes_replicate_to_every_member() {
    let cluster = TestCluster::new(3, 3);
    let leader = cluster.wait_for_leader(&[]).await;

    let mut indexes = Vec::new();
    for round in 0..5 {
        let index = cluster.nodes[leader]
            .core
            .submit(format!("write-{}", round).into_bytes())
            .await
            .unwrap();
        indexes.push(index);
    }
    assert!(indexes.windows(2).all(|w| w[1] == w[0] + 1));

    // Every member applies the same commands in the same order
    for _ in 0..100 {
        if cluster
            .nodes
            .iter()
            .all(|node| node.adapter.commands().len() == 5)
        {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    let reference = cluster.nodes[leader].adapter.commands();
    assert_eq!(reference.len(), 5);
    for node in &cluster.nodes {
        assert_eq!(node.adapter.commands(), reference);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_rejects_writes_with_leader_hint() {
    let cluster = TestCluster::new(3, 3);
    let leader = cluster.wait_for_leader(&[]).await;
    let follower = (leader + 1) % 3;

    let result = cluster.nodes[follower]
        .core
        .submit(b"misdirected".to_vec())
        .await;

    match result {
        Err(ConsensusError::NotLeader { leader_hint }) => {
            assert_eq!(leader_hint, Some(cluster.nodes[leader].id));
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_kill_triggers_failover() {
    let cluster = TestCluster::new(3, 3);
    let first = cluster.wait_for_leader(&[]).await;
    let first_id = cluster.nodes[first].id;

    cluster.nodes[first]
        .core
        .submit(b"before-failover".to_vec())
        .await
        .unwrap();

    // Kill the leader process
    cluster.network.disconnect(first_id);
    cluster.nodes[first].core.shutdown().await;

    // A new leader emerges from the remaining two and accepts writes
    let second = cluster.wait_for_leader(&[first_id]).await;
    assert_ne!(second, first);

    cluster.nodes[second]
        .core
        .submit(b"after-failover".to_vec())
        .await
        .unwrap();

    // The entry committed by the old leader is never lost: both
    // survivors apply it before the new write
    for _ in 0..100 {
        if cluster.nodes[second].adapter.commands().len() == 2 {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    let commands = cluster.nodes[second].adapter.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].1, b"before-failover".to_vec());
    assert_eq!(commands[1].1, b"after-failover".to_vec());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refusing_member_never_leads() {
    let refusing_position = 0;
    let cluster = TestCluster::with_config(3, 3, |position| ConsensusConfig {
        refuse_to_be_leader: position == refusing_position,
        ..fast_config()
    });

    for _ in 0..3 {
        let leader = cluster.wait_for_leader(&[]).await;
        assert_ne!(leader, refusing_position);
        sleep(Duration::from_millis(100)).await;
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_removal_below_minimum_is_rejected() {
    let cluster = TestCluster::new(3, 3);
    let leader = cluster.wait_for_leader(&[]).await;
    let victim = cluster.nodes[(leader + 1) % 3].id;

    let result = cluster.nodes[leader].core.remove_member(victim).await;
    assert!(matches!(
        result,
        Err(ConsensusError::Membership(
            crate::membership::MembershipError::BelowMinimumSize { .. }
        ))
    ));

    // The voting set is untouched
    let status = cluster.nodes[leader].core.status();
    assert_eq!(status.voting_members.len(), 3);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_added_member_catches_up_and_gains_vote() {
    let mut cluster = TestCluster::new(3, 2);
    let leader = cluster.wait_for_leader(&[]).await;

    for round in 0..3 {
        cluster.nodes[leader]
            .core
            .submit(format!("seed-{}", round).into_bytes())
            .await
            .unwrap();
    }

    // Boot the newcomer with the seed configuration (it is not a
    // member until the addition entry commits)
    let newcomer_id = MemberId::new();
    let newcomer = spawn_node(
        &cluster.network,
        newcomer_id,
        cluster.initial.clone(),
        fast_config(),
        cluster.store_id,
    );

    cluster.nodes[leader]
        .core
        .add_member(newcomer_id)
        .await
        .unwrap();

    // The leader promotes it once its log catches up
    for _ in 0..200 {
        let status = cluster.nodes[leader].core.status();
        if status.voting_members.contains(&newcomer_id) {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    let status = cluster.nodes[leader].core.status();
    assert!(status.voting_members.contains(&newcomer_id));

    // And it applies the log like everyone else
    for _ in 0..100 {
        if newcomer.adapter.commands().len() == 3 {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        newcomer.adapter.commands(),
        cluster.nodes[leader].adapter.commands()
    );

    cluster.nodes.push(newcomer);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_blocks_without_quorum() {
    let cluster = TestCluster::with_config(3, 3, |_| ConsensusConfig {
        commit_timeout_ms: 1500,
        ..fast_config()
    });
    let leader = cluster.wait_for_leader(&[]).await;
    let leader_id = cluster.nodes[leader].id;

    // Cut the leader off from both followers
    for node in &cluster.nodes {
        if node.id != leader_id {
            cluster.network.block(leader_id, node.id);
        }
    }

    // The write must not silently succeed: it either times out or
    // fails once the isolated leader steps down
    let result = cluster.nodes[leader].core.submit(b"doomed".to_vec()).await;
    assert!(result.is_err(), "write succeeded without a quorum");

    cluster.shutdown().await;
}
