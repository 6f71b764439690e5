//! The replicated state machine as seen by the raft actor.

use bytes::Bytes;
use raftcache_core::LogIndex;

/// A deterministic state machine fed by committed log entries.
///
/// Every method runs on the raft actor, one at a time, so implementations
/// never see `apply` interleaved with `snapshot` or `restore`.
///
/// An `Err` from any method is fatal: the actor stops and the node must be
/// restarted. Per-command failures that do not halt replication belong in
/// `Output`.
pub trait StateMachine: Send + 'static {
    /// Result of applying one command, handed back to the proposer.
    type Output: Send + 'static;
    /// Fatal state machine error.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Applies the command committed at `index`.
    ///
    /// # Errors
    /// Returns an error if the command cannot be decoded or the store fails.
    fn apply(&mut self, index: LogIndex, data: &[u8]) -> Result<Self::Output, Self::Error>;

    /// Exports the full state as an opaque image.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    fn snapshot(&mut self) -> Result<Bytes, Self::Error>;

    /// Replaces the full state with an image produced by `snapshot`.
    ///
    /// # Errors
    /// Returns an error if the image is malformed or the store fails.
    fn restore(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Clears all state. Called on startup when there is no snapshot, since
    /// the whole log is replayed from index 1.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    fn reset(&mut self) -> Result<(), Self::Error>;
}
