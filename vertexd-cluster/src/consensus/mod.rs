//! Replicated consensus
//!
//! Raft-family consensus for the voting core of a VertexD cluster:
//! leader election with pre-voting, quorum-based log replication,
//! commit-index advancement, leader-lease step-down, and membership
//! changes ordered through the log itself.
//!
//! Each member runs one `RaftCore`: a single event-loop task owns all
//! role transitions and vote handling, fed by the transport listener,
//! timers, and client submissions. Divergence deeper than the retained
//! log escalates to the snapshot catch-up protocol via the signal
//! stream `RaftCore::take_catchup_signals` exposes.

mod config;
mod core;
mod hard_state;
mod state;
mod types;

pub use config::ConsensusConfig;
pub use core::RaftCore;
pub use hard_state::HardState;
pub use state::CatchupNeeded;
pub use types::{
    ConsensusError, ConsensusResult, LogEntry, LogIndex, MemberId, Payload, RaftMessage, RaftRole,
    RaftStatus, Term,
};

#[cfg(test)]
mod tests;
