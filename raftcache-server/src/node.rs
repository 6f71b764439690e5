//! Node assembly: storage, state machine, raft actor, transport and services.

use std::net::SocketAddr;
use std::sync::Arc;

use raftcache_core::ServerId;
use raftcache_raft::{FileStorage, RaftError, RaftStorage, StorageError};
use raftcache_runtime::{
    ConfigError, NodeStatus, RaftServer, ServerError, ServerHandle, Transport, TransportConfig,
    TransportError, TransportHandle,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bootstrap::{initial_configuration, should_bootstrap};
use crate::client::RpcClient;
use crate::config::{NodeConfig, BUCKET_STORE_FILE};
use crate::fsm::{ApplyOutcome, CacheFsm};
use crate::membership::MembershipService;
use crate::router::CacheRouter;
use crate::service::CacheService;
use crate::store::{RedbStore, StoreError};

/// Errors starting a node.
#[derive(Debug, Error)]
pub enum StartError {
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Raft storage could not be opened.
    #[error("raft storage error: {0}")]
    Storage(#[from] StorageError),

    /// The bucket store could not be opened.
    #[error("bucket store error: {0}")]
    Store(#[from] StoreError),

    /// The listener could not be bound.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The raft server failed to start or bootstrap.
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// The initial configuration is invalid.
    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] RaftError),
}

/// A running cache node.
#[derive(Debug)]
pub struct Node {
    id: ServerId,
    local_addr: SocketAddr,
    raft: ServerHandle<ApplyOutcome>,
    router: CacheRouter<RedbStore>,
    membership: MembershipService,
    client: RpcClient,
    transport: TransportHandle,
    raft_task: JoinHandle<()>,
    serve_task: JoinHandle<()>,
}

impl Node {
    /// Opens the data directory and starts serving.
    ///
    /// A node with no persisted state bootstraps a single-voter cluster if
    /// the bootstrap policy says so; otherwise it waits to be added.
    ///
    /// An ephemeral listen port (0) advertises the bound address.
    ///
    /// # Errors
    /// Returns an error if any component fails to start.
    pub async fn start(config: NodeConfig) -> Result<Self, StartError> {
        config.validate()?;
        let listen_addr = config.listen_addr()?;

        let storage = FileStorage::open(&config.data_dir, config.snapshot_retain)?;
        let has_state = storage.has_existing_state()?;
        let bootstrap = should_bootstrap(&config.id, config.bootstrap, has_state);

        let store = RedbStore::open(&config.data_dir.join(BUCKET_STORE_FILE))?;
        let fsm = CacheFsm::new(store);

        let mut transport_config = TransportConfig::new(listen_addr);
        if listen_addr.port() != 0 {
            transport_config = transport_config.with_advertise_address(config.advertise_address.clone());
        }
        let (transport, incoming) = Transport::bind(transport_config)?;
        let local_addr = transport.local_addr()?;
        let handle = transport.handle();
        let advertise_address = handle.advertise_address().to_string();

        let server = RaftServer::new(
            config.server_config(&advertise_address),
            storage,
            fsm.clone(),
            handle.clone(),
        )?;
        let (raft, actor) = server.run(incoming);
        let raft_task = tokio::spawn(actor);

        if bootstrap {
            raft.bootstrap(initial_configuration(&config.id, &advertise_address)?)
                .await?;
            info!(node_id = %config.id, address = %advertise_address, "Bootstrapped new cluster");
        } else if !has_state {
            info!(node_id = %config.id, "No existing state, waiting to be added to a cluster");
        }

        let timeout = config.timing.request_timeout;
        let client = RpcClient::new(handle.clone(), timeout);
        let router =
            CacheRouter::new(fsm, raft.clone(), client.clone()).with_request_timeout(timeout);
        let membership =
            MembershipService::new(raft.clone(), config.voters.iter().cloned()).with_timeout(timeout);
        let service = CacheService::new(router.clone(), membership.clone());
        let serve_task = transport.serve(Arc::new(service));

        info!(node_id = %config.id, addr = %local_addr, "Cache node started");
        Ok(Self {
            id: config.id,
            local_addr,
            raft,
            router,
            membership,
            client,
            transport: handle,
            raft_task,
            serve_task,
        })
    }

    /// Returns this node's id.
    #[must_use]
    pub const fn id(&self) -> &ServerId {
        &self.id
    }

    /// Returns the bound listener address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the address advertised to other members.
    #[must_use]
    pub fn advertise_address(&self) -> &str {
        self.transport.advertise_address()
    }

    /// Returns the latest status snapshot.
    #[must_use]
    pub fn status(&self) -> NodeStatus {
        self.raft.status()
    }

    /// Returns the raft handle.
    #[must_use]
    pub const fn raft(&self) -> &ServerHandle<ApplyOutcome> {
        &self.raft
    }

    /// Returns the request router.
    #[must_use]
    pub const fn cache(&self) -> &CacheRouter<RedbStore> {
        &self.router
    }

    /// Returns the membership service.
    #[must_use]
    pub const fn membership(&self) -> &MembershipService {
        &self.membership
    }

    /// Returns a client for calling other nodes.
    #[must_use]
    pub const fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Stops the raft actor and the transport, and waits for both.
    pub async fn shutdown(self) {
        if let Err(e) = self.raft.shutdown().await {
            warn!(node_id = %self.id, error = %e, "Raft server already stopped");
        }
        self.transport.shutdown().await;
        let _ = self.raft_task.await;
        let _ = self.serve_task.await;
        info!(node_id = %self.id, "Cache node stopped");
    }
}
