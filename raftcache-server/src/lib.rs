//! Raftcache Server - A replicated bucket cache on Raft.
//!
//! Every node holds a bucket store (bucket -> key -> value). Writes go
//! through the Raft log and are applied in log order on every node, so all
//! replicas converge on the same contents.
//!
//! # Overview
//!
//! - `Command`: the mutations carried by the log (`Set`, `CreateBucket`)
//! - `BucketStore`: storage behind the state machine, `RedbStore` on disk
//!   and `MemoryStore` for tests
//! - `CacheFsm`: applies committed commands, snapshots and restores the store
//! - `CacheRouter`: local reads, leader writes, single-hop forwarding
//! - `MembershipService`: leader/configuration/state reads and
//!   single-entry membership changes
//! - `Node`: wires storage, the raft actor, the transport and the services
//!
//! # Example
//!
//! ```ignore
//! use raftcache_server::{Node, NodeConfig};
//!
//! let node = Node::start(NodeConfig::new(id, "cache-0.cache:7000", "/data")).await?;
//! node.cache().create_bucket("sessions", false).await?;
//! node.cache().put("sessions", "alice", "token", false).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod bootstrap;
mod client;
mod command;
mod config;
mod error;
mod fsm;
mod membership;
mod node;
mod router;
mod rpc;
mod service;
mod store;
mod wire;

#[cfg(test)]
mod testing;

pub use bootstrap::{initial_configuration, should_bootstrap};
pub use client::{MembershipView, RpcClient};
pub use command::{Command, CommandDecodeError, InvalidCommand};
pub use config::{parse_voters, NodeConfig, BUCKET_STORE_FILE};
pub use error::CacheError;
pub use fsm::{ApplyError, ApplyOutcome, CacheFsm, FsmError};
pub use membership::{membership_view, MembershipService};
pub use node::{Node, StartError};
pub use router::{CacheRouter, REQUEST_TIMEOUT_DEFAULT};
pub use rpc::{JoinedAs, Member, Request, Response, RpcDecodeError};
pub use service::CacheService;
pub use store::{BucketStore, MemoryStore, RedbStore, StoreError, StoreImage, StoreResult};
