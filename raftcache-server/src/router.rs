//! Client request router.
//!
//! Reads are served from the local store and may be stale on followers.
//! Writes are proposed on the leader and wait for the FSM outcome. A follower
//! forwards a write to the leader exactly once: the forwarded request is
//! marked and a node that receives a marked request while not leading
//! answers `NotLeader` instead of forwarding again.

use std::time::Duration;

use raftcache_core::Limits;
use raftcache_runtime::ServerHandle;
use tracing::debug;

use crate::client::RpcClient;
use crate::command::Command;
use crate::error::CacheError;
use crate::fsm::{ApplyOutcome, CacheFsm};
use crate::store::BucketStore;

/// Deadline for a local commit wait or a forwarded call.
pub const REQUEST_TIMEOUT_DEFAULT: Duration = Duration::from_secs(1);

/// Routes cache reads and writes.
pub struct CacheRouter<B> {
    fsm: CacheFsm<B>,
    raft: ServerHandle<ApplyOutcome>,
    client: RpcClient,
    limits: Limits,
    request_timeout: Duration,
}

impl<B> Clone for CacheRouter<B> {
    fn clone(&self) -> Self {
        Self {
            fsm: self.fsm.clone(),
            raft: self.raft.clone(),
            client: self.client.clone(),
            limits: self.limits,
            request_timeout: self.request_timeout,
        }
    }
}

impl<B> std::fmt::Debug for CacheRouter<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRouter")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl<B: BucketStore> CacheRouter<B> {
    /// Creates a router.
    #[must_use]
    pub fn new(fsm: CacheFsm<B>, raft: ServerHandle<ApplyOutcome>, client: RpcClient) -> Self {
        Self {
            fsm,
            raft,
            client,
            limits: Limits::new(),
            request_timeout: REQUEST_TIMEOUT_DEFAULT,
        }
    }

    /// Sets the request deadline.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the size limits applied before proposing.
    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Reads a value from the local store.
    ///
    /// # Errors
    /// Returns `Storage` if the store cannot be read.
    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.fsm.get(bucket, key)?)
    }

    /// Writes `value` under `key`. The bucket must exist.
    ///
    /// # Errors
    /// See [`CacheRouter::submit`].
    pub async fn put(&self, bucket: &str, key: &str, value: &str, forwarded: bool) -> Result<(), CacheError> {
        let command = Command::Set {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        };
        self.submit(&command, forwarded).await
    }

    /// Creates an empty bucket.
    ///
    /// # Errors
    /// See [`CacheRouter::submit`].
    pub async fn create_bucket(&self, bucket: &str, forwarded: bool) -> Result<(), CacheError> {
        let command = Command::CreateBucket {
            bucket: bucket.to_string(),
        };
        self.submit(&command, forwarded).await
    }

    /// Proposes `command` on the leader, forwarding to it from a follower.
    ///
    /// # Errors
    /// - `BadRequest` if a name or size limit is violated.
    /// - `NotLeader` if `forwarded` is set and this node is not the leader.
    /// - `NoLeader` if no leader is known.
    /// - `Retry` if this node is named leader but no longer leads.
    /// - `CommitTimeout` or `LeadershipLost` if the outcome is unknown.
    /// - The FSM outcome (`BucketNotFound`, `BucketExists`, `Storage`).
    pub async fn submit(&self, command: &Command, forwarded: bool) -> Result<(), CacheError> {
        command.validate(&self.limits)?;

        let status = self.raft.status();
        if status.is_leader() {
            let applied = self.raft.propose(command.encode(), self.request_timeout).await?;
            debug!(index = applied.index.get(), bucket = %command.bucket(), "Write committed");
            return applied.output.map_err(CacheError::from);
        }

        let leader_hint = status.leader.as_ref().map(|l| l.id.as_str().to_string());
        if forwarded {
            return Err(CacheError::NotLeader { leader_hint });
        }

        let leader = status.leader.ok_or(CacheError::NoLeader)?;
        if leader.id == status.id {
            return Err(CacheError::Retry);
        }

        debug!(leader = %leader.id, address = %leader.address, "Forwarding write to leader");
        match command {
            Command::Set { bucket, key, value } => {
                self.client
                    .put(&leader.address, bucket, key, value, true)
                    .await
            }
            Command::CreateBucket { bucket } => {
                self.client
                    .create_bucket(&leader.address, bucket, true)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{single_node, TIMEOUT};

    #[tokio::test]
    async fn test_leader_applies_writes() {
        let node = single_node(true).await;
        node.raft.wait_for(TIMEOUT, |s| s.is_leader()).await.unwrap();
        let router = node.router();

        router.create_bucket("users", false).await.unwrap();
        router.put("users", "alice", "1", false).await.unwrap();
        assert_eq!(router.get("users", "alice").unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_fsm_errors_reach_the_caller() {
        let node = single_node(true).await;
        node.raft.wait_for(TIMEOUT, |s| s.is_leader()).await.unwrap();
        let router = node.router();

        assert_eq!(
            router.put("missing", "k", "v", false).await,
            Err(CacheError::BucketNotFound {
                bucket: "missing".to_string()
            })
        );
        router.create_bucket("b", false).await.unwrap();
        assert_eq!(
            router.create_bucket("b", false).await,
            Err(CacheError::BucketExists {
                bucket: "b".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_follower_without_leader() {
        let node = single_node(false).await;
        let router = node.router();

        assert_eq!(router.create_bucket("b", false).await, Err(CacheError::NoLeader));
        assert_eq!(
            router.create_bucket("b", true).await,
            Err(CacheError::NotLeader { leader_hint: None })
        );
    }

    #[tokio::test]
    async fn test_invalid_command_never_proposed() {
        let node = single_node(true).await;
        node.raft.wait_for(TIMEOUT, |s| s.is_leader()).await.unwrap();
        let router = node.router();
        let before = node.raft.status().commit_index;

        let result = router.put("", "k", "v", false).await;
        assert!(matches!(result, Err(CacheError::BadRequest { .. })));
        assert_eq!(node.raft.status().commit_index, before);
    }
}
