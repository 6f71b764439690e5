//! Transport trait abstraction for Raft peer communication.
//!
//! The raft actor only needs two things from a transport: fire-and-forget
//! delivery of a message to an address, and a way to tell it which addresses
//! are still cluster members. Production code uses [`TransportHandle`]
//! (pooled TCP); tests plug in in-memory implementations.
//!
//! [`TransportHandle`]: crate::TransportHandle

use std::collections::HashSet;

use async_trait::async_trait;
use raftcache_raft::Message;

/// Outbound side of a transport as seen by the raft actor.
///
/// Implementations must not block on the network: a message that cannot be
/// queued is dropped and Raft's retries take over.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    /// Queues `message` for delivery to the server at `address`.
    async fn send(&self, address: &str, message: Message);

    /// Closes pooled connections to any address not in `addresses`.
    async fn retain(&self, addresses: &HashSet<String>);
}
