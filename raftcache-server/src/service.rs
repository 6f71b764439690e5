//! RPC handler dispatching requests to the router and membership service.

use async_trait::async_trait;
use bytes::Bytes;
use raftcache_core::LogIndex;
use raftcache_runtime::RpcHandler;
use tracing::warn;

use crate::error::CacheError;
use crate::membership::MembershipService;
use crate::router::CacheRouter;
use crate::rpc::{Member, Request, Response};
use crate::store::BucketStore;

/// Serves the cache RPC surface on a node's listener.
#[derive(Debug)]
pub struct CacheService<B> {
    router: CacheRouter<B>,
    membership: MembershipService,
}

impl<B: BucketStore> CacheService<B> {
    /// Creates the service.
    #[must_use]
    pub const fn new(router: CacheRouter<B>, membership: MembershipService) -> Self {
        Self { router, membership }
    }

    /// Handles one decoded request.
    pub async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::GetLeader => Response::Leader(self.membership.get_leader().map(|l| Member {
                id: l.id.as_str().to_string(),
                address: l.address,
            })),
            Request::GetConfiguration => {
                let view = self.membership.get_configuration();
                Response::Configuration {
                    voters: view.voters,
                    non_voters: view.non_voters,
                }
            }
            Request::GetState => Response::State(self.membership.get_state().to_string()),
            Request::Join { id, address } => {
                Response::from_result(self.membership.join(&id, &address).await, |(index, joined_as)| {
                    Response::Joined {
                        index: index.get(),
                        joined_as,
                    }
                })
            }
            Request::AddVoter {
                id,
                address,
                previous_index,
            } => index_response(
                self.membership
                    .add_voter(&id, &address, LogIndex::new(previous_index))
                    .await,
            ),
            Request::AddNonVoter {
                id,
                address,
                previous_index,
            } => index_response(
                self.membership
                    .add_non_voter(&id, &address, LogIndex::new(previous_index))
                    .await,
            ),
            Request::RemoveServer { id, previous_index } => index_response(
                self.membership
                    .remove_server(&id, LogIndex::new(previous_index))
                    .await,
            ),
            Request::PromoteServer {
                id,
                address,
                previous_index,
            } => index_response(
                self.membership
                    .promote_server(&id, &address, LogIndex::new(previous_index))
                    .await,
            ),
            Request::AddPeer { id, address } => {
                index_response(self.membership.add_peer(&id, &address).await)
            }
            Request::Put {
                bucket,
                key,
                value,
                forwarded,
            } => Response::from_result(
                self.router.put(&bucket, &key, &value, forwarded).await,
                |()| Response::Done,
            ),
            Request::CreateBucket { bucket, forwarded } => Response::from_result(
                self.router.create_bucket(&bucket, forwarded).await,
                |()| Response::Done,
            ),
            Request::Get { bucket, key } => {
                Response::from_result(self.router.get(&bucket, &key), Response::Value)
            }
        }
    }
}

fn index_response(result: Result<LogIndex, CacheError>) -> Response {
    Response::from_result(result, |index| Response::Index(index.get()))
}

#[async_trait]
impl<B: BucketStore> RpcHandler for CacheService<B> {
    async fn handle(&self, body: Bytes) -> Bytes {
        let response = match Request::decode(&body) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                warn!(error = %e, "Rejecting undecodable rpc");
                Response::Error(CacheError::BadRequest {
                    reason: e.to_string(),
                })
            }
        };
        response.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{single_node, TIMEOUT};

    #[tokio::test]
    async fn test_dispatch_reads_and_writes() {
        let node = single_node(true).await;
        node.raft.wait_for(TIMEOUT, |s| s.is_leader()).await.unwrap();
        let service = node.service(&[]);

        let created = service
            .dispatch(Request::CreateBucket {
                bucket: "b".to_string(),
                forwarded: false,
            })
            .await;
        assert_eq!(created, Response::Done);

        let put = service
            .dispatch(Request::Put {
                bucket: "b".to_string(),
                key: "k".to_string(),
                value: "v".to_string(),
                forwarded: false,
            })
            .await;
        assert_eq!(put, Response::Done);

        let got = service
            .dispatch(Request::Get {
                bucket: "b".to_string(),
                key: "k".to_string(),
            })
            .await;
        assert_eq!(got, Response::Value(Some("v".to_string())));
        assert_eq!(
            service.dispatch(Request::GetState).await,
            Response::State("leader".to_string())
        );
    }

    #[tokio::test]
    async fn test_undecodable_body_is_bad_request() {
        let node = single_node(false).await;
        let service = node.service(&[]);

        let body = service.handle(Bytes::from_static(&[200])).await;
        assert!(matches!(
            Response::decode(&body).unwrap(),
            Response::Error(CacheError::BadRequest { .. })
        ));
    }
}
