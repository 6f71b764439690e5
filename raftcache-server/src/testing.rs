//! In-process single node used by unit tests.

use std::time::Duration;

use raftcache_core::ServerId;
use raftcache_raft::MemoryStorage;
use raftcache_runtime::{
    RaftServer, ServerConfig, ServerHandle, TimingConfig, Transport, TransportConfig,
};
use tokio::task::JoinHandle;

use crate::bootstrap::initial_configuration;
use crate::client::RpcClient;
use crate::fsm::{ApplyOutcome, CacheFsm};
use crate::membership::MembershipService;
use crate::router::CacheRouter;
use crate::service::CacheService;
use crate::store::MemoryStore;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestNode {
    pub raft: ServerHandle<ApplyOutcome>,
    pub fsm: CacheFsm<MemoryStore>,
    pub client: RpcClient,
    pub address: String,
    _actor: JoinHandle<()>,
}

impl TestNode {
    pub fn router(&self) -> CacheRouter<MemoryStore> {
        CacheRouter::new(self.fsm.clone(), self.raft.clone(), self.client.clone())
    }

    pub fn service(&self, voters: &[&str]) -> CacheService<MemoryStore> {
        let membership =
            MembershipService::new(self.raft.clone(), voters.iter().map(|v| (*v).to_string()));
        CacheService::new(self.router(), membership)
    }
}

/// Starts `cache-0` on memory storage, bootstrapped as a single voter if
/// `bootstrap` is set. Nothing listens on its address.
pub async fn single_node(bootstrap: bool) -> TestNode {
    let (transport, incoming) =
        Transport::bind(TransportConfig::new("127.0.0.1:0".parse().unwrap())).unwrap();
    let handle = transport.handle();
    let address = handle.advertise_address().to_string();
    let id = ServerId::new("cache-0").unwrap();

    let config = ServerConfig::new(id.clone(), address.clone())
        .with_timing(TimingConfig::fast_for_testing());
    let fsm = CacheFsm::new(MemoryStore::new());
    let server = RaftServer::new(config, MemoryStorage::new(), fsm.clone(), handle.clone()).unwrap();
    let (raft, actor) = server.run(incoming);
    let actor = tokio::spawn(actor);

    if bootstrap {
        raft.bootstrap(initial_configuration(&id, &address).unwrap())
            .await
            .unwrap();
    }

    TestNode {
        raft,
        fsm,
        client: RpcClient::new(handle, TIMEOUT),
        address,
        _actor: actor,
    }
}
