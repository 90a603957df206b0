pub mod catchup;
pub mod clock;
pub mod consensus;
pub mod membership;
pub mod raft_log;
pub mod replica;
pub mod state_machine;
pub mod topology;
pub mod transport;

// Re-export commonly used types
pub use catchup::{
    CatchupClient, CatchupConfig, CatchupError, CatchupServer, CopyGuard, SnapshotManifest,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use consensus::{
    ConsensusConfig, ConsensusError, LogEntry, LogIndex, MemberId, Payload, RaftCore, RaftMessage,
    RaftRole, RaftStatus, Term,
};
pub use membership::{ClusterConfiguration, MembershipError, MembershipManager};
pub use raft_log::{FsyncMode, LogStoreConfig, LogStoreError, PruneStrategy, SegmentedLog};
pub use replica::{
    AnyCoreMember, ChooseUpstream, PreferredMember, ReadReplicaSync, ReplicaConfig, ReplicaError,
    ServerGroup,
};
pub use state_machine::{SnapshotData, StateMachineAdapter, StateMachineError, StoreId};
pub use topology::{FixedTopology, MemberInfo, MemberRole, TopologyView};
pub use transport::{
    MemoryNetwork, RaftListener, RaftTransport, TcpTransport, TransportConfig, TransportError,
};
