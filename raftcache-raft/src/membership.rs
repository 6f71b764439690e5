//! Cluster membership: servers, suffrage and configuration changes.
//!
//! A `Configuration` is replicated through the log as an ordinary entry of
//! kind `EntryKind::Configuration`. Changes are applied one server at a time,
//! so any majority of the old voter set overlaps any majority of the new one.

use std::collections::HashSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use raftcache_core::{Limits, ServerId};

use crate::error::RaftError;

/// Whether a server takes part in elections and commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Suffrage {
    /// Votes in elections and counts toward commit quorums.
    Voter,
    /// Receives the log but never votes and never becomes leader.
    NonVoter,
}

impl Suffrage {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Voter => 0,
            Self::NonVoter => 1,
        }
    }

    const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Voter),
            1 => Some(Self::NonVoter),
            _ => None,
        }
    }
}

/// A member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    /// Unique server id.
    pub id: ServerId,
    /// Address other members use to reach this server.
    pub address: String,
    /// Voting rights.
    pub suffrage: Suffrage,
}

impl ServerDescriptor {
    /// Creates a voting member.
    #[must_use]
    pub fn voter(id: ServerId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            suffrage: Suffrage::Voter,
        }
    }

    /// Creates a non-voting member.
    #[must_use]
    pub fn non_voter(id: ServerId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            suffrage: Suffrage::NonVoter,
        }
    }

    /// Returns true if this server votes.
    #[must_use]
    pub fn is_voter(&self) -> bool {
        self.suffrage == Suffrage::Voter
    }
}

/// A single-server membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    /// Add a server as a voter, or promote it if it is already a member.
    AddVoter {
        /// Server id.
        id: ServerId,
        /// Server address.
        address: String,
    },
    /// Add a server as a non-voter. An existing voter keeps its vote.
    AddNonVoter {
        /// Server id.
        id: ServerId,
        /// Server address.
        address: String,
    },
    /// Remove a server. Removing an unknown server is a no-op change.
    RemoveServer {
        /// Server id.
        id: ServerId,
    },
    /// Flip a server to voter in one step, adding it if it is unknown.
    PromoteServer {
        /// Server id.
        id: ServerId,
        /// Server address.
        address: String,
    },
}

/// The ordered set of servers forming the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    servers: Vec<ServerDescriptor>,
}

impl Configuration {
    /// Creates a configuration from a list of servers.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if ids repeat, an address is empty or
    /// the cluster is too large.
    pub fn new(servers: Vec<ServerDescriptor>) -> Result<Self, RaftError> {
        let config = Self { servers };
        config.validate()?;
        Ok(config)
    }

    /// Returns the empty configuration of a node that has not joined yet.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            servers: Vec::new(),
        }
    }

    /// Returns all servers in order.
    #[must_use]
    pub fn servers(&self) -> &[ServerDescriptor] {
        &self.servers
    }

    /// Returns true if there are no servers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Looks up a server by id.
    #[must_use]
    pub fn get(&self, id: &ServerId) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| &s.id == id)
    }

    /// Returns true if the server is a member.
    #[must_use]
    pub fn contains(&self, id: &ServerId) -> bool {
        self.get(id).is_some()
    }

    /// Returns true if the server is a voting member.
    #[must_use]
    pub fn is_voter(&self, id: &ServerId) -> bool {
        self.get(id).is_some_and(ServerDescriptor::is_voter)
    }

    /// Returns the address of a member.
    #[must_use]
    pub fn address_of(&self, id: &ServerId) -> Option<&str> {
        self.get(id).map(|s| s.address.as_str())
    }

    /// Returns the voting members.
    pub fn voters(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.iter().filter(|s| s.is_voter())
    }

    /// Returns the non-voting members.
    pub fn non_voters(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.iter().filter(|s| !s.is_voter())
    }

    /// Returns the number of voters needed for a majority.
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        self.voters().count() / 2 + 1
    }

    /// Returns true if the voters satisfying `pred` form a majority.
    ///
    /// An empty voter set never has a quorum.
    pub fn has_quorum(&self, mut pred: impl FnMut(&ServerId) -> bool) -> bool {
        let voters = self.voters().count();
        if voters == 0 {
            return false;
        }
        let granted = self.voters().filter(|s| pred(&s.id)).count();
        granted >= self.quorum_size()
    }

    /// Returns the configuration that results from applying `change`.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if the result would have no voters or
    /// break the limits checked by `Configuration::new`.
    pub fn apply(&self, change: &ConfigChange) -> Result<Self, RaftError> {
        let mut servers = self.servers.clone();

        match change {
            ConfigChange::AddVoter { id, address } | ConfigChange::PromoteServer { id, address } => {
                match servers.iter_mut().find(|s| &s.id == id) {
                    Some(existing) => {
                        existing.suffrage = Suffrage::Voter;
                        existing.address.clone_from(address);
                    }
                    None => servers.push(ServerDescriptor::voter(id.clone(), address.clone())),
                }
            }
            ConfigChange::AddNonVoter { id, address } => {
                match servers.iter_mut().find(|s| &s.id == id) {
                    Some(existing) => existing.address.clone_from(address),
                    None => servers.push(ServerDescriptor::non_voter(id.clone(), address.clone())),
                }
            }
            ConfigChange::RemoveServer { id } => {
                servers.retain(|s| &s.id != id);
            }
        }

        let next = Self::new(servers)?;
        if next.voters().count() == 0 {
            return Err(RaftError::InvalidConfiguration {
                reason: "configuration must keep at least one voter".to_string(),
            });
        }
        Ok(next)
    }

    fn validate(&self) -> Result<(), RaftError> {
        let max = Limits::new().max_cluster_size as usize;
        if self.servers.len() > max {
            return Err(RaftError::InvalidConfiguration {
                reason: format!("{} servers exceeds maximum {max}", self.servers.len()),
            });
        }

        let mut seen = HashSet::with_capacity(self.servers.len());
        for server in &self.servers {
            if !seen.insert(&server.id) {
                return Err(RaftError::InvalidConfiguration {
                    reason: format!("duplicate server id {}", server.id),
                });
            }
            if server.address.is_empty() {
                return Err(RaftError::InvalidConfiguration {
                    reason: format!("server {} has an empty address", server.id),
                });
            }
        }
        Ok(())
    }

    /// Encodes the configuration for a log entry or snapshot.
    ///
    /// Format: count (u32) then per server: id, address (u16 length-prefixed
    /// UTF-8) and suffrage (u8).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.servers.len() * 48);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Appends the encoded configuration to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        // Safe cast: server count is bounded by max_cluster_size.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.servers.len() as u32);
        for server in &self.servers {
            put_short_str(buf, server.id.as_str());
            put_short_str(buf, &server.address);
            buf.put_u8(server.suffrage.to_u8());
        }
    }

    /// Decodes a configuration, consuming it from the front of `buf`.
    ///
    /// Returns `None` if the data is malformed.
    pub fn decode_from(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let count = buf.get_u32_le() as usize;
        if count > Limits::new().max_cluster_size as usize {
            return None;
        }

        let mut servers = Vec::with_capacity(count);
        for _ in 0..count {
            let id = ServerId::new(get_short_str(buf)?).ok()?;
            let address = get_short_str(buf)?;
            if buf.remaining() < 1 {
                return None;
            }
            let suffrage = Suffrage::from_u8(buf.get_u8())?;
            servers.push(ServerDescriptor {
                id,
                address,
                suffrage,
            });
        }

        Self::new(servers).ok()
    }

    /// Decodes a configuration that fills the whole buffer.
    ///
    /// Returns `None` if the data is malformed or has trailing bytes.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut buf = data;
        let config = Self::decode_from(&mut buf)?;
        buf.is_empty().then_some(config)
    }
}

fn put_short_str(buf: &mut BytesMut, s: &str) {
    // Safe cast: ids are at most 128 bytes and addresses are host:port strings.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_short_str(buf: &mut impl Buf) -> Option<String> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return None;
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).ok()
}
