//! Raftcache Tests - Deterministic simulation of raftcache clusters.
//!
//! ## Test Organization
//!
//! **Simulation Tests** (`*_tests.rs`): whole clusters of `RaftNode`s driven
//! by logical ticks over a lossy in-memory network
//! - `raft_tests`: elections, replication, crashes, partitions, random faults
//! - `membership_tests`: voter and non-voter changes, promotion, removal
//! - `snapshot_tests`: compaction, snapshot install, restart from snapshot
//!
//! **Support Modules**:
//! - `simulation`: the seeded cluster driver
//! - `properties`: safety checks (single leader per term, log matching,
//!   leader completeness, state machine safety)
//! - `scenarios`: cluster shapes and regression seeds
//!
//! ## Naming Conventions
//!
//! - Simulation tests: `test_sim_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod properties;
pub mod scenarios;
pub mod simulation;

#[cfg(test)]
mod membership_tests;
#[cfg(test)]
mod raft_tests;
