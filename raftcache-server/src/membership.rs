//! Membership control service.
//!
//! Read operations answer from the local status snapshot. Mutating operations
//! become one configuration entry each and return its index once committed;
//! on a follower they fail with `NotLeader`.

use std::collections::HashSet;
use std::time::Duration;

use raftcache_core::{LogIndex, ServerId};
use raftcache_raft::{ConfigChange, Configuration};
use raftcache_runtime::{LeaderInfo, ServerHandle};
use tracing::info;

use crate::client::MembershipView;
use crate::error::CacheError;
use crate::fsm::ApplyOutcome;
use crate::router::REQUEST_TIMEOUT_DEFAULT;
use crate::rpc::{JoinedAs, Member};

/// Serves membership reads and changes for one node.
#[derive(Debug, Clone)]
pub struct MembershipService {
    raft: ServerHandle<ApplyOutcome>,
    /// Ids that join as voters; everyone else joins as a non-voter.
    voters: HashSet<String>,
    timeout: Duration,
}

impl MembershipService {
    /// Creates the service with a voter allow-list.
    #[must_use]
    pub fn new(raft: ServerHandle<ApplyOutcome>, voters: impl IntoIterator<Item = String>) -> Self {
        Self {
            raft,
            voters: voters.into_iter().collect(),
            timeout: REQUEST_TIMEOUT_DEFAULT,
        }
    }

    /// Sets the commit deadline for each change.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the leader this node knows of.
    #[must_use]
    pub fn get_leader(&self) -> Option<LeaderInfo> {
        self.raft.status().leader
    }

    /// Returns the latest configuration split by suffrage.
    #[must_use]
    pub fn get_configuration(&self) -> MembershipView {
        membership_view(&self.raft.status().configuration)
    }

    /// Returns this node's role: `leader`, `follower` or `candidate`.
    #[must_use]
    pub fn get_state(&self) -> &'static str {
        self.raft.status().state.as_str()
    }

    /// Adds a server, as a voter if it is on the allow-list.
    ///
    /// # Errors
    /// Returns `NotLeader` on a follower, or a configuration error.
    pub async fn join(&self, id: &str, address: &str) -> Result<(LogIndex, JoinedAs), CacheError> {
        let server = server_id(id)?;
        let address = address.to_string();
        let (change, joined_as) = if self.voters.contains(id) {
            (ConfigChange::AddVoter { id: server, address }, JoinedAs::Voter)
        } else {
            (
                ConfigChange::AddNonVoter { id: server, address },
                JoinedAs::NonVoter,
            )
        };

        let index = self.change(change, LogIndex::new(0)).await?;
        info!(id = %id, joined_as = joined_as.as_str(), index = index.get(), "Server joined");
        Ok((index, joined_as))
    }

    /// Adds a voter.
    ///
    /// # Errors
    /// Returns `NotLeader` on a follower, `ConfigurationConflict` if
    /// `previous_index` is stale, or a configuration error.
    pub async fn add_voter(&self, id: &str, address: &str, previous_index: LogIndex) -> Result<LogIndex, CacheError> {
        let change = ConfigChange::AddVoter {
            id: server_id(id)?,
            address: address.to_string(),
        };
        self.change(change, previous_index).await
    }

    /// Adds a non-voter.
    ///
    /// # Errors
    /// Same as [`MembershipService::add_voter`].
    pub async fn add_non_voter(
        &self,
        id: &str,
        address: &str,
        previous_index: LogIndex,
    ) -> Result<LogIndex, CacheError> {
        let change = ConfigChange::AddNonVoter {
            id: server_id(id)?,
            address: address.to_string(),
        };
        self.change(change, previous_index).await
    }

    /// Removes a server.
    ///
    /// # Errors
    /// Same as [`MembershipService::add_voter`].
    pub async fn remove_server(&self, id: &str, previous_index: LogIndex) -> Result<LogIndex, CacheError> {
        let change = ConfigChange::RemoveServer { id: server_id(id)? };
        self.change(change, previous_index).await
    }

    /// Makes a server a voter with a single configuration entry.
    ///
    /// # Errors
    /// Same as [`MembershipService::add_voter`].
    pub async fn promote_server(
        &self,
        id: &str,
        address: &str,
        previous_index: LogIndex,
    ) -> Result<LogIndex, CacheError> {
        let change = ConfigChange::PromoteServer {
            id: server_id(id)?,
            address: address.to_string(),
        };
        self.change(change, previous_index).await
    }

    /// Adds a server keeping the number of voters odd.
    ///
    /// With an even member count every non-voter is promoted and the new
    /// server joins as a voter; otherwise it joins as a non-voter. Each step
    /// commits before the next is appended. Returns the index of the last
    /// step.
    ///
    /// # Errors
    /// Returns the first step's error; earlier steps stay committed.
    pub async fn add_peer(&self, id: &str, address: &str) -> Result<LogIndex, CacheError> {
        let status = self.raft.status();
        if !status.is_leader() {
            return Err(CacheError::NotLeader {
                leader_hint: status.leader.map(|l| l.id.as_str().to_string()),
            });
        }

        let configuration = status.configuration;
        let total = configuration.servers().len();
        if total % 2 == 1 {
            return self.add_non_voter(id, address, LogIndex::new(0)).await;
        }

        for server in configuration.non_voters() {
            info!(id = %server.id, "Promoting non-voter before adding peer");
            self.promote_server(server.id.as_str(), &server.address, LogIndex::new(0))
                .await?;
        }
        self.add_voter(id, address, LogIndex::new(0)).await
    }

    async fn change(&self, change: ConfigChange, expected: LogIndex) -> Result<LogIndex, CacheError> {
        Ok(self
            .raft
            .change_configuration(change, expected, self.timeout)
            .await?)
    }
}

/// Splits a configuration into voters and non-voters.
#[must_use]
pub fn membership_view(configuration: &Configuration) -> MembershipView {
    let member = |s: &raftcache_raft::ServerDescriptor| Member {
        id: s.id.as_str().to_string(),
        address: s.address.clone(),
    };
    MembershipView {
        voters: configuration.voters().map(member).collect(),
        non_voters: configuration.non_voters().map(member).collect(),
    }
}

fn server_id(id: &str) -> Result<ServerId, CacheError> {
    ServerId::new(id).map_err(|e| CacheError::BadRequest {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{single_node, TIMEOUT};

    async fn ready_leader(voters: &[&str]) -> (crate::testing::TestNode, MembershipService) {
        let node = single_node(true).await;
        node.raft
            .wait_for(TIMEOUT, |s| s.is_leader() && s.commit_index > s.configuration_index)
            .await
            .unwrap();
        let service = MembershipService::new(
            node.raft.clone(),
            voters.iter().map(|v| (*v).to_string()),
        );
        (node, service)
    }

    #[tokio::test]
    async fn test_reads_on_leader() {
        let (node, service) = ready_leader(&[]).await;
        assert_eq!(service.get_state(), "leader");
        assert_eq!(service.get_leader().unwrap().id.as_str(), "cache-0");

        let view = service.get_configuration();
        assert_eq!(view.voters.len(), 1);
        assert_eq!(view.voters[0].address, node.address);
        assert!(view.non_voters.is_empty());
    }

    #[tokio::test]
    async fn test_join_uses_allow_list() {
        let (_node, service) = ready_leader(&["cache-9"]).await;

        let (index, joined_as) = service.join("cache-1", "127.0.0.1:1").await.unwrap();
        assert_eq!(joined_as, JoinedAs::NonVoter);
        assert!(index.get() > 0);

        let view = service.get_configuration();
        assert_eq!(view.non_voters[0].id, "cache-1");
        assert_eq!(view.voters.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_previous_index_conflicts() {
        let (_node, service) = ready_leader(&[]).await;
        let first = service
            .add_non_voter("cache-1", "127.0.0.1:1", LogIndex::new(0))
            .await
            .unwrap();

        let result = service
            .remove_server("cache-1", LogIndex::new(first.get() - 1))
            .await;
        assert!(matches!(result, Err(CacheError::ConfigurationConflict { .. })));

        let removed = service.remove_server("cache-1", first).await.unwrap();
        assert!(removed > first);
        assert!(service.get_configuration().non_voters.is_empty());
    }

    #[tokio::test]
    async fn test_add_peer_with_odd_membership_adds_non_voter() {
        let (_node, service) = ready_leader(&[]).await;
        service.add_peer("cache-1", "127.0.0.1:1").await.unwrap();

        let view = service.get_configuration();
        assert_eq!(view.voters.len(), 1);
        assert_eq!(view.non_voters.len(), 1);
    }

    #[tokio::test]
    async fn test_follower_rejects_changes() {
        let node = single_node(false).await;
        let service = MembershipService::new(node.raft.clone(), Vec::new());

        assert_eq!(service.get_state(), "follower");
        assert!(service.get_leader().is_none());
        assert!(matches!(
            service.join("cache-1", "127.0.0.1:1").await,
            Err(CacheError::NotLeader { .. })
        ));
        assert!(matches!(
            service.add_peer("cache-1", "127.0.0.1:1").await,
            Err(CacheError::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_id_rejected() {
        let (_node, service) = ready_leader(&[]).await;
        assert!(matches!(
            service.add_voter("bad id", "127.0.0.1:1", LogIndex::new(0)).await,
            Err(CacheError::BadRequest { .. })
        ));
    }
}
