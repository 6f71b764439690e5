//! Typed client for the cache RPC surface.
//!
//! Used by followers to forward writes to the leader, and by operators and
//! tests to drive the membership service of a remote node.

use std::time::Duration;

use raftcache_runtime::TransportHandle;
use tracing::debug;

use crate::error::CacheError;
use crate::rpc::{JoinedAs, Member, Request, Response};

/// Calls other nodes over the shared transport.
#[derive(Debug, Clone)]
pub struct RpcClient {
    transport: TransportHandle,
    timeout: Duration,
}

/// Configuration split by suffrage, as returned by `GetConfiguration`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MembershipView {
    /// Voting members.
    pub voters: Vec<Member>,
    /// Non-voting members.
    pub non_voters: Vec<Member>,
}

impl MembershipView {
    /// Total number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.voters.len() + self.non_voters.len()
    }

    /// Returns true if there are no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RpcClient {
    /// Creates a client with a per-call deadline.
    #[must_use]
    pub const fn new(transport: TransportHandle, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Sends `request` to `address` and decodes the response.
    ///
    /// # Errors
    /// Returns `Rpc` for transport or decode failures, or the remote error.
    pub async fn call(&self, address: &str, request: &Request) -> Result<Response, CacheError> {
        debug!(address = %address, ?request, "Sending rpc");
        let body = self
            .transport
            .call(address, request.encode(), self.timeout)
            .await?;
        match Response::decode(&body) {
            Ok(Response::Error(err)) => Err(err),
            Ok(response) => Ok(response),
            Err(e) => Err(CacheError::Rpc {
                message: e.to_string(),
            }),
        }
    }

    /// Asks `address` who the leader is.
    ///
    /// # Errors
    /// Returns an error if the call fails.
    pub async fn get_leader(&self, address: &str) -> Result<Option<Member>, CacheError> {
        match self.call(address, &Request::GetLeader).await? {
            Response::Leader(leader) => Ok(leader),
            other => Err(unexpected(&other)),
        }
    }

    /// Reads the configuration as known by `address`.
    ///
    /// # Errors
    /// Returns an error if the call fails.
    pub async fn get_configuration(&self, address: &str) -> Result<MembershipView, CacheError> {
        match self.call(address, &Request::GetConfiguration).await? {
            Response::Configuration { voters, non_voters } => {
                Ok(MembershipView { voters, non_voters })
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Reads the role of `address`.
    ///
    /// # Errors
    /// Returns an error if the call fails.
    pub async fn get_state(&self, address: &str) -> Result<String, CacheError> {
        match self.call(address, &Request::GetState).await? {
            Response::State(state) => Ok(state),
            other => Err(unexpected(&other)),
        }
    }

    /// Asks the leader at `address` to add a server.
    ///
    /// # Errors
    /// Returns an error if the call fails or the change is rejected.
    pub async fn join(
        &self,
        address: &str,
        id: &str,
        member_address: &str,
    ) -> Result<(u64, JoinedAs), CacheError> {
        let request = Request::Join {
            id: id.to_string(),
            address: member_address.to_string(),
        };
        match self.call(address, &request).await? {
            Response::Joined { index, joined_as } => Ok((index, joined_as)),
            other => Err(unexpected(&other)),
        }
    }

    /// Sends a membership request that answers with a configuration index.
    ///
    /// # Errors
    /// Returns an error if the call fails or the change is rejected.
    pub async fn change_membership(&self, address: &str, request: &Request) -> Result<u64, CacheError> {
        match self.call(address, request).await? {
            Response::Index(index) => Ok(index),
            other => Err(unexpected(&other)),
        }
    }

    /// Asks the leader at `address` to add a peer keeping the voter count odd.
    ///
    /// # Errors
    /// Returns an error if the call fails or a step is rejected.
    pub async fn add_peer(&self, address: &str, id: &str, member_address: &str) -> Result<u64, CacheError> {
        let request = Request::AddPeer {
            id: id.to_string(),
            address: member_address.to_string(),
        };
        self.change_membership(address, &request).await
    }

    /// Writes a value through `address`.
    ///
    /// # Errors
    /// Returns an error if the call fails or the write is rejected.
    pub async fn put(
        &self,
        address: &str,
        bucket: &str,
        key: &str,
        value: &str,
        forwarded: bool,
    ) -> Result<(), CacheError> {
        let request = Request::Put {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            forwarded,
        };
        self.expect_done(address, &request).await
    }

    /// Creates a bucket through `address`.
    ///
    /// # Errors
    /// Returns an error if the call fails or the bucket exists.
    pub async fn create_bucket(&self, address: &str, bucket: &str, forwarded: bool) -> Result<(), CacheError> {
        let request = Request::CreateBucket {
            bucket: bucket.to_string(),
            forwarded,
        };
        self.expect_done(address, &request).await
    }

    /// Reads a value from the store of `address`.
    ///
    /// # Errors
    /// Returns an error if the call fails.
    pub async fn get(&self, address: &str, bucket: &str, key: &str) -> Result<Option<String>, CacheError> {
        let request = Request::Get {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        match self.call(address, &request).await? {
            Response::Value(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    async fn expect_done(&self, address: &str, request: &Request) -> Result<(), CacheError> {
        match self.call(address, request).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> CacheError {
    CacheError::Rpc {
        message: format!("unexpected response: {response:?}"),
    }
}
