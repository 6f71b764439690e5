//! Node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use raftcache_core::ServerId;
use raftcache_raft::limits::SNAPSHOT_RETAIN_COUNT;
use raftcache_runtime::{ConfigError, ServerConfig, TimingConfig, SNAPSHOT_THRESHOLD_DEFAULT};

/// Name of the bucket store file inside the data directory.
pub const BUCKET_STORE_FILE: &str = "buckets.redb";

/// Everything needed to start a cache node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's id.
    pub id: ServerId,
    /// Address other nodes use to reach this node (`host:port`).
    pub advertise_address: String,
    /// Socket to listen on. Defaults to all interfaces on the advertised port.
    pub listen_addr: Option<SocketAddr>,
    /// Directory for the Raft log, metadata, snapshots and bucket store.
    pub data_dir: PathBuf,
    /// Timing configuration.
    pub timing: TimingConfig,
    /// Applied entries between snapshots.
    pub snapshot_threshold: u64,
    /// Snapshots kept on disk.
    pub snapshot_retain: usize,
    /// Bootstrap a new cluster if this node has no state.
    pub bootstrap: bool,
    /// Ids that join as voters.
    pub voters: Vec<String>,
}

impl NodeConfig {
    /// Creates a configuration with defaults for everything optional.
    #[must_use]
    pub fn new(id: ServerId, advertise_address: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            advertise_address: advertise_address.into(),
            listen_addr: None,
            data_dir: data_dir.into(),
            timing: TimingConfig::default(),
            snapshot_threshold: SNAPSHOT_THRESHOLD_DEFAULT,
            snapshot_retain: SNAPSHOT_RETAIN_COUNT,
            bootstrap: false,
            voters: Vec::new(),
        }
    }

    /// Sets the listen socket.
    #[must_use]
    pub const fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
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

    /// Sets the bootstrap flag.
    #[must_use]
    pub const fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Sets the voter allow-list.
    #[must_use]
    pub fn with_voters(mut self, voters: Vec<String>) -> Self {
        self.voters = voters;
        self
    }

    /// Returns the socket to listen on.
    ///
    /// # Errors
    /// Returns `InvalidAddress` if no listen address is set and the
    /// advertised address has no valid port.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = self.listen_addr {
            return Ok(addr);
        }
        let port = self
            .advertise_address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
            .ok_or_else(|| ConfigError::InvalidAddress {
                message: format!("no port in advertise address {:?}", self.advertise_address),
            })?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    /// Returns the runtime configuration, advertising `advertise_address`.
    #[must_use]
    pub fn server_config(&self, advertise_address: &str) -> ServerConfig {
        ServerConfig::new(self.id.clone(), advertise_address)
            .with_data_dir(self.data_dir.clone())
            .with_timing(self.timing.clone())
            .with_snapshot_threshold(self.snapshot_threshold)
            .with_snapshot_retain(self.snapshot_retain)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the address or timing is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        self.server_config(&self.advertise_address).validate()
    }
}

/// Parses a comma-separated voter allow-list, ignoring blanks.
#[must_use]
pub fn parse_voters(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}
