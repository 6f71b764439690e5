//! Raftcache Raft - Raft consensus with dynamic membership.
//!
//! This crate is the consensus core of raftcache. `RaftNode` is a pure state
//! machine: it consumes ticks, messages and proposals and returns outputs
//! (messages to send, committed entries to apply, snapshots to restore).
//! The only side effect it performs is writing through its `RaftStorage`,
//! so every term, vote and log change is durable before any output that
//! depends on it is released.
//!
//! # Design Principles
//!
//! - **Correctness first**: election safety, log matching and leader
//!   completeness hold under any message loss, reordering or crash
//! - **Deterministic**: all randomness comes from a seeded RNG, time is ticks
//! - **Single-server membership changes**: at most one configuration change
//!   in flight; each entry is committed by the configuration that precedes it
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod file_storage;
mod log;
mod membership;
mod message;
mod snapshot;
mod state;
mod storage;

pub use config::RaftConfig;
pub use error::{RaftError, RaftResult};
pub use file_storage::FileStorage;
pub use log::{EntryKind, LogEntry, RaftLog, ENTRY_HEADER_BYTES};
pub use membership::{ConfigChange, Configuration, ServerDescriptor, Suffrage};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    Message, RequestVoteRequest, RequestVoteResponse,
};
pub use snapshot::{Snapshot, SnapshotMeta, SnapshotStore};
pub use state::{RaftNode, RaftOutput, RaftState};
pub use storage::{MemoryStorage, PersistentState, RaftStorage, StorageError, StorageResult};

/// Raft timing and batching limits.
pub mod limits {
    /// Smallest allowed election timeout, in ticks.
    pub const ELECTION_TIMEOUT_TICKS_MIN: u32 = 3;

    /// Default election timeout range, in ticks.
    pub const ELECTION_TIMEOUT_TICKS_DEFAULT: (u32, u32) = (10, 20);

    /// Default heartbeat interval, in ticks.
    pub const HEARTBEAT_TICKS_DEFAULT: u32 = 3;

    /// Number of snapshots kept on disk.
    pub const SNAPSHOT_RETAIN_COUNT: usize = 2;

    /// Default cap on entries in one `AppendEntries` request.
    pub const ENTRIES_PER_APPEND_DEFAULT: u32 = 512;

    /// Default byte budget of the entries in one `AppendEntries` request
    /// (4 MiB).
    pub const APPEND_BYTES_DEFAULT: u32 = 4 * 1024 * 1024;

    /// Default size of one `InstallSnapshot` chunk (1 MiB).
    pub const SNAPSHOT_CHUNK_BYTES_DEFAULT: u32 = 1024 * 1024;
}
