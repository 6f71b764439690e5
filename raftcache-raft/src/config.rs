//! Raft configuration.
//!
//! Time inside the consensus core is measured in ticks. The runtime decides
//! how long a tick is and converts wall-clock timeouts into tick counts.

use raftcache_core::{ServerId, MAX_FRAME_PAYLOAD_BYTES};

use crate::limits::{
    APPEND_BYTES_DEFAULT, ELECTION_TIMEOUT_TICKS_DEFAULT, ELECTION_TIMEOUT_TICKS_MIN,
    ENTRIES_PER_APPEND_DEFAULT, HEARTBEAT_TICKS_DEFAULT, SNAPSHOT_CHUNK_BYTES_DEFAULT,
};

/// Configuration for a Raft node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID.
    pub id: ServerId,

    /// Minimum election timeout in ticks.
    pub election_timeout_min_ticks: u32,

    /// Maximum election timeout in ticks.
    pub election_timeout_max_ticks: u32,

    /// Heartbeat interval in ticks.
    pub heartbeat_ticks: u32,

    /// Maximum number of entries sent in one `AppendEntries` request.
    pub max_entries_per_append: u32,

    /// Byte budget of the entries in one `AppendEntries` request. The first
    /// entry is always sent, even when it alone exceeds the budget.
    pub max_append_bytes: u32,

    /// Size of one `InstallSnapshot` chunk in bytes.
    pub snapshot_chunk_bytes: u32,

    /// Seed for the election timeout RNG.
    pub seed: u64,
}

impl RaftConfig {
    /// Creates a configuration with default timing.
    ///
    /// The RNG seed is derived from the server id so that nodes in one
    /// cluster pick different timeouts even when started together.
    #[must_use]
    pub fn new(id: ServerId) -> Self {
        let seed = u64::from(crc32fast::hash(id.as_str().as_bytes()));
        let (min, max) = ELECTION_TIMEOUT_TICKS_DEFAULT;
        Self {
            id,
            election_timeout_min_ticks: min,
            election_timeout_max_ticks: max,
            heartbeat_ticks: HEARTBEAT_TICKS_DEFAULT,
            max_entries_per_append: ENTRIES_PER_APPEND_DEFAULT,
            max_append_bytes: APPEND_BYTES_DEFAULT,
            snapshot_chunk_bytes: SNAPSHOT_CHUNK_BYTES_DEFAULT,
            seed,
        }
    }

    /// Sets the election timeout range.
    ///
    /// # Panics
    /// Panics if min > max.
    #[must_use]
    pub fn with_election_ticks(mut self, min: u32, max: u32) -> Self {
        assert!(min <= max, "min must be <= max");
        self.election_timeout_min_ticks = min;
        self.election_timeout_max_ticks = max;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_ticks(mut self, ticks: u32) -> Self {
        self.heartbeat_ticks = ticks;
        self
    }

    /// Sets the RNG seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the `AppendEntries` batch size.
    #[must_use]
    pub const fn with_max_entries_per_append(mut self, max: u32) -> Self {
        self.max_entries_per_append = max;
        self
    }

    /// Sets the `AppendEntries` byte budget.
    #[must_use]
    pub const fn with_max_append_bytes(mut self, bytes: u32) -> Self {
        self.max_append_bytes = bytes;
        self
    }

    /// Sets the `InstallSnapshot` chunk size.
    #[must_use]
    pub const fn with_snapshot_chunk_bytes(mut self, bytes: u32) -> Self {
        self.snapshot_chunk_bytes = bytes;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub const fn validate(&self) -> Result<(), &'static str> {
        if self.election_timeout_min_ticks < ELECTION_TIMEOUT_TICKS_MIN {
            return Err("election timeout too short");
        }
        if self.election_timeout_min_ticks > self.election_timeout_max_ticks {
            return Err("election timeout min > max");
        }
        if self.heartbeat_ticks == 0 {
            return Err("heartbeat interval must be positive");
        }
        if self.heartbeat_ticks >= self.election_timeout_min_ticks {
            return Err("heartbeat interval must be less than election timeout");
        }
        if self.max_entries_per_append == 0 {
            return Err("max entries per append must be positive");
        }
        if self.max_append_bytes == 0 || self.max_append_bytes > MAX_FRAME_PAYLOAD_BYTES {
            return Err("append byte budget must be positive and fit in a frame");
        }
        if self.snapshot_chunk_bytes == 0 || self.snapshot_chunk_bytes > MAX_FRAME_PAYLOAD_BYTES {
            return Err("snapshot chunk must be positive and fit in a frame");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ServerId {
        ServerId::new(name).unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = RaftConfig::new(id("node-0"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_seed_differs_per_server() {
        let a = RaftConfig::new(id("node-0"));
        let b = RaftConfig::new(id("node-1"));
        assert_ne!(a.seed, b.seed);
        assert_eq!(a.seed, RaftConfig::new(id("node-0")).seed);
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_election() {
        let config = RaftConfig::new(id("node-0"))
            .with_election_ticks(5, 10)
            .with_heartbeat_ticks(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_byte_budgets_must_fit_in_frame() {
        let config = RaftConfig::new(id("node-0"));
        assert!(config.max_append_bytes <= MAX_FRAME_PAYLOAD_BYTES);

        let oversized = config.clone().with_max_append_bytes(MAX_FRAME_PAYLOAD_BYTES + 1);
        assert!(oversized.validate().is_err());
        assert!(config.clone().with_max_append_bytes(0).validate().is_err());

        let chunk = config.with_snapshot_chunk_bytes(MAX_FRAME_PAYLOAD_BYTES + 1);
        assert!(chunk.validate().is_err());
    }

    #[test]
    #[should_panic(expected = "min must be <= max")]
    fn test_inverted_election_range_panics() {
        let _ = RaftConfig::new(id("node-0")).with_election_ticks(10, 5);
    }
}
