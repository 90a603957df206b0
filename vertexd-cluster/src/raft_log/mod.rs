//! Durable raft log storage
//!
//! Append-only, segmented storage for the replicated log:
//! - Bounded-size segment files, rotated as they fill
//! - Framed records (length, crc32, bincode entry) with a recovery
//!   scan that tolerates a torn tail but refuses corruption
//! - Suffix truncation for replication-conflict repair
//! - Whole-segment pruning under a configurable retention strategy
//! - Reset to a fresh window after a snapshot install

mod segment;
mod store;
mod types;

pub use store::{LogRange, SegmentedLog};
pub use types::{FsyncMode, LogStoreConfig, LogStoreError, PruneStrategy, Result};
