//! Runtime configuration.
//!
//! Wall-clock timing lives here; the consensus core only sees tick counts.

use std::path::PathBuf;
use std::time::Duration;

use raftcache_core::ServerId;
use raftcache_raft::limits::{
    APPEND_BYTES_DEFAULT, ELECTION_TIMEOUT_TICKS_MIN, SNAPSHOT_RETAIN_COUNT,
};
use raftcache_raft::RaftConfig;
use thiserror::Error;

/// Default number of applied entries between snapshots.
pub const SNAPSHOT_THRESHOLD_DEFAULT: u64 = 8192;

/// Configuration for a Raft server node.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This node's unique identifier.
    pub id: ServerId,
    /// Address other nodes use to reach this node (`host:port`).
    pub advertise_address: String,
    /// Data directory for the Raft log, metadata and snapshots.
    pub data_dir: PathBuf,
    /// Timing configuration.
    pub timing: TimingConfig,
    /// Applied entries since the last snapshot that trigger a new one.
    pub snapshot_threshold: u64,
    /// Snapshots kept on disk.
    pub snapshot_retain: usize,
    /// Byte budget of one `AppendEntries` batch.
    pub max_append_bytes: u32,
}

impl ServerConfig {
    /// Creates a new server configuration.
    #[must_use]
    pub fn new(id: ServerId, advertise_address: impl Into<String>) -> Self {
        Self {
            id,
            advertise_address: advertise_address.into(),
            data_dir: PathBuf::from("data"),
            timing: TimingConfig::default(),
            snapshot_threshold: SNAPSHOT_THRESHOLD_DEFAULT,
            snapshot_retain: SNAPSHOT_RETAIN_COUNT,
            max_append_bytes: APPEND_BYTES_DEFAULT,
        }
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Sets the timing configuration.
    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Sets the snapshot threshold.
    #[must_use]
    pub const fn with_snapshot_threshold(mut self, entries: u64) -> Self {
        self.snapshot_threshold = entries;
        self
    }

    /// Sets how many snapshots are kept on disk.
    #[must_use]
    pub const fn with_snapshot_retain(mut self, count: usize) -> Self {
        self.snapshot_retain = count;
        self
    }

    /// Sets the `AppendEntries` byte budget.
    #[must_use]
    pub const fn with_max_append_bytes(mut self, bytes: u32) -> Self {
        self.max_append_bytes = bytes;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timing.validate()?;
        self.raft_config()
            .validate()
            .map_err(|reason| ConfigError::InvalidConsensus {
                message: reason.to_string(),
            })?;
        if self.advertise_address.is_empty() {
            return Err(ConfigError::InvalidAddress {
                message: "advertise address must not be empty".to_string(),
            });
        }
        if self.snapshot_threshold == 0 {
            return Err(ConfigError::InvalidSnapshot {
                message: "snapshot threshold must be positive".to_string(),
            });
        }
        if self.snapshot_retain == 0 {
            return Err(ConfigError::InvalidSnapshot {
                message: "at least one snapshot must be retained".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the consensus core configuration for this node.
    #[must_use]
    pub fn raft_config(&self) -> RaftConfig {
        let timing = &self.timing;
        RaftConfig::new(self.id.clone())
            .with_election_ticks(
                timing.to_ticks(timing.election_timeout_min),
                timing.to_ticks(timing.election_timeout_max),
            )
            .with_heartbeat_ticks(timing.to_ticks(timing.heartbeat_interval))
            .with_max_append_bytes(self.max_append_bytes)
    }
}

/// Timing configuration for Raft.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Interval between ticks of the consensus core.
    pub tick_interval: Duration,
    /// Minimum election timeout.
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    pub election_timeout_max: Duration,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Deadline for a client request (commit wait or forwarded call).
    pub request_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            request_timeout: Duration::from_secs(1),
        }
    }
}

impl TimingConfig {
    /// Creates timing config suitable for testing (faster timeouts).
    #[must_use]
    pub const fn fast_for_testing() -> Self {
        Self {
            tick_interval: Duration::from_millis(5),
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(15),
            request_timeout: Duration::from_secs(1),
        }
    }

    /// Validates the timing configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::InvalidTiming {
                message: "tick_interval must be positive".to_string(),
            });
        }

        if self.election_timeout_max < self.election_timeout_min {
            return Err(ConfigError::InvalidTiming {
                message: "election_timeout_max must be >= election_timeout_min".to_string(),
            });
        }

        // Followers must hear at least one heartbeat per election window.
        if self.election_timeout_min <= self.heartbeat_interval {
            return Err(ConfigError::InvalidTiming {
                message: "election_timeout_min must be > heartbeat_interval".to_string(),
            });
        }

        if self.to_ticks(self.election_timeout_min) < ELECTION_TIMEOUT_TICKS_MIN {
            return Err(ConfigError::InvalidTiming {
                message: format!(
                    "election_timeout_min must span at least {ELECTION_TIMEOUT_TICKS_MIN} ticks"
                ),
            });
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTiming {
                message: "request_timeout must be positive".to_string(),
            });
        }

        Ok(())
    }

    /// Converts a duration to a whole number of ticks, rounding up.
    #[must_use]
    pub fn to_ticks(&self, duration: Duration) -> u32 {
        let tick = self.tick_interval.as_micros().max(1);
        let ticks = duration.as_micros().div_ceil(tick).max(1);
        u32::try_from(ticks).unwrap_or(u32::MAX)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid timing configuration.
    #[error("invalid timing: {message}")]
    InvalidTiming {
        /// Error description.
        message: String,
    },
    /// Invalid address.
    #[error("invalid address: {message}")]
    InvalidAddress {
        /// Error description.
        message: String,
    },
    /// Invalid snapshot policy.
    #[error("invalid snapshot policy: {message}")]
    InvalidSnapshot {
        /// Error description.
        message: String,
    },
    /// Consensus settings the Raft core rejects.
    #[error("invalid consensus settings: {message}")]
    InvalidConsensus {
        /// Error description.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config() -> ServerConfig {
        ServerConfig::new(ServerId::new("cache-0").unwrap(), "127.0.0.1:7000")
    }

    #[test]
    fn test_default_timing_is_valid() {
        let timing = TimingConfig::default();
        assert!(timing.validate().is_ok());
    }

    #[test]
    fn test_fast_timing_is_valid() {
        let timing = TimingConfig::fast_for_testing();
        assert!(timing.validate().is_ok());
    }

    #[test]
    fn test_invalid_election_timeout_range() {
        let timing = TimingConfig {
            election_timeout_min: Duration::from_millis(200),
            election_timeout_max: Duration::from_millis(100),
            ..Default::default()
        };
        assert!(timing.validate().is_err());
    }

    #[test]
    fn test_election_timeout_shorter_than_ticks_rejected() {
        let timing = TimingConfig {
            tick_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            request_timeout: Duration::from_secs(1),
        };
        assert!(timing.validate().is_err());
    }

    #[test]
    fn test_to_ticks_rounds_up() {
        let timing = TimingConfig::default();
        assert_eq!(timing.to_ticks(Duration::from_millis(150)), 15);
        assert_eq!(timing.to_ticks(Duration::from_millis(151)), 16);
        assert_eq!(timing.to_ticks(Duration::ZERO), 1);
    }

    #[test]
    fn test_raft_config_from_timing() {
        let config = make_config();
        let raft = config.raft_config();
        assert_eq!(raft.election_timeout_min_ticks, 15);
        assert_eq!(raft.election_timeout_max_ticks, 30);
        assert_eq!(raft.heartbeat_ticks, 5);
        assert!(raft.validate().is_ok());
    }

    #[test]
    fn test_server_config_defaults() {
        let config = make_config();
        assert_eq!(config.snapshot_threshold, SNAPSHOT_THRESHOLD_DEFAULT);
        assert_eq!(config.snapshot_retain, 2);
        assert!(config.validate().is_ok());
        assert!(config.with_snapshot_threshold(0).validate().is_err());
    }

    #[test]
    fn test_append_budget_must_fit_in_frame() {
        let config = make_config();
        assert_eq!(config.raft_config().max_append_bytes, config.max_append_bytes);

        let oversized = config.with_max_append_bytes(raftcache_core::MAX_FRAME_BYTES);
        assert!(matches!(
            oversized.validate(),
            Err(ConfigError::InvalidConsensus { .. })
        ));
    }
}
