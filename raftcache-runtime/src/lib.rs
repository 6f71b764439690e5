//! Raftcache Runtime - Drives a Raft node with real time, TCP and disk.
//!
//! `raftcache-raft` is a pure state machine. This crate supplies what it
//! deliberately lacks: a clock, a network and a place to apply commands.
//!
//! # Overview
//!
//! The runtime provides:
//! - `RaftServer`: the raft actor, one task owning the `RaftNode`, the
//!   state machine and the table of pending proposals
//! - `ServerHandle`: cloneable handle to propose, change membership,
//!   bootstrap and read a by-value `NodeStatus`
//! - `Transport`: pooled TCP connections carrying Raft messages and
//!   request/response RPCs over one length-prefixed frame format
//! - `ServerConfig` / `TimingConfig`: wall-clock settings, converted to ticks
//!
//! # Example
//!
//! ```ignore
//! use raftcache_runtime::{RaftServer, ServerConfig, Transport, TransportConfig};
//!
//! let (transport, incoming) = Transport::bind(TransportConfig::new(listen_addr))?;
//! let server = RaftServer::new(config, storage, fsm, transport.handle())?;
//! let (handle, actor) = server.run(incoming);
//! tokio::spawn(actor);
//! transport.serve(rpc_handler);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod codec;
mod config;
mod server;
mod state_machine;
mod transport;
mod transport_trait;

pub use codec::{decode_frame, encode_frame, CodecError, CodecResult, Frame};
pub use config::{ConfigError, ServerConfig, TimingConfig, SNAPSHOT_THRESHOLD_DEFAULT};
pub use server::{Applied, LeaderInfo, NodeStatus, RaftServer, ServerError, ServerHandle};
pub use state_machine::StateMachine;
pub use transport::{
    IncomingMessage, RpcHandler, Transport, TransportConfig, TransportError, TransportHandle,
    TransportResult,
};
pub use transport_trait::RaftTransport;
