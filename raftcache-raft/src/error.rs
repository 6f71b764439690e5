//! Errors returned by consensus operations.

use raftcache_core::{LogIndex, ServerId};
use thiserror::Error;

use crate::storage::StorageError;

/// Errors returned by `RaftNode` operations that callers can act on.
#[derive(Debug, Error)]
pub enum RaftError {
    /// This node is not the leader.
    #[error("not leader (leader hint: {leader_hint:?})")]
    NotLeader {
        /// The leader this node currently believes in, if any.
        leader_hint: Option<ServerId>,
    },

    /// The configuration changed under the caller, or a change is in flight.
    #[error("configuration conflict: expected index {expected}, latest is {latest}")]
    ConfigurationConflict {
        /// The configuration index the caller expected.
        expected: LogIndex,
        /// The index of the latest configuration.
        latest: LogIndex,
    },

    /// The requested change would produce an invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// Bootstrap was requested on a node that already has state.
    #[error("node already has persisted state; refusing to bootstrap")]
    AlreadyBootstrapped,

    /// Durable storage failed. The node must stop.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for consensus operations.
pub type RaftResult<T> = Result<T, RaftError>;
