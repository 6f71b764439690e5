//! Raftcache Core - Strongly-typed identifiers and limits for raftcache.
//!
//! Everything here is shared by the consensus core, the runtime and the
//! cache server. The crate has no dependencies and performs no I/O.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: a `LogIndex` can never be passed where a `TermId`
//!   is expected, and server ids are validated on construction
//! - **Explicit limits**: every name, value and frame has a bounded size
//! - **Explicit types**: Use u32/u64, not usize, in anything that is persisted
//!   or sent over the wire

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod types;

pub use error::{Error, Result};
pub use limits::{Limits, FRAME_HEADROOM_BYTES, MAX_FRAME_BYTES, MAX_FRAME_PAYLOAD_BYTES};
pub use types::{LogIndex, ServerId, TermId};
