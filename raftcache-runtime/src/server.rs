//! Raft server implementation.
//!
//! The `RaftServer` is the single owner of a node's consensus state. It runs
//! as one task (the raft actor) and handles:
//! - Tick-based timer management (single tick drives elections and heartbeats)
//! - Proposals and configuration changes, tracked until they commit
//! - Processing Raft outputs (sending messages, applying commits, restoring
//!   snapshots)
//! - Taking snapshots once enough entries were applied
//! - Publishing a by-value `NodeStatus` after every step
//!
//! # Tick-Based Timing
//!
//! The consensus core never reads a clock. The actor calls `tick()` every
//! `tick_interval`; election timeouts and heartbeats are counted in ticks.
//!
//! # Outcome of a Proposal
//!
//! A proposal resolves exactly once:
//! - `Applied` when its entry commits and the state machine applied it
//! - `LeadershipLost` when the node steps down or another leader's entry
//!   takes its index; the command may or may not commit later
//! - `CommitTimeout` when the caller's deadline passes first; same caveat

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use raftcache_core::{LogIndex, ServerId, TermId};
use raftcache_raft::{
    ConfigChange, Configuration, EntryKind, LogEntry, Message, RaftError, RaftNode, RaftOutput,
    RaftState, RaftStorage, Snapshot,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::state_machine::StateMachine;
use crate::transport::IncomingMessage;
use crate::transport_trait::RaftTransport;

/// Capacity of the command queue.
const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Server errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    /// This node is not the leader.
    #[error("not leader (leader hint: {leader_hint:?})")]
    NotLeader {
        /// The leader this node currently believes in, if any.
        leader_hint: Option<ServerId>,
    },

    /// The entry did not commit before the deadline. Outcome unknown.
    #[error("commit timed out")]
    CommitTimeout,

    /// Leadership was lost before the entry committed. Outcome unknown.
    #[error("leadership lost before commit")]
    LeadershipLost,

    /// The configuration changed under the caller, or a change is in flight.
    #[error("configuration conflict: expected index {expected}, latest is {latest}")]
    ConfigurationConflict {
        /// The configuration index the caller expected.
        expected: LogIndex,
        /// The index of the latest configuration.
        latest: LogIndex,
    },

    /// The requested change would produce an invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// Bootstrap was requested on a node that already has state.
    #[error("node already bootstrapped")]
    AlreadyBootstrapped,

    /// The server task is not running.
    #[error("server unavailable")]
    ServerUnavailable,

    /// Invalid server configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Storage or state machine failure. The server has stopped.
    #[error("fatal error: {message}")]
    Fatal {
        /// Error message.
        message: String,
    },
}

impl From<RaftError> for ServerError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { leader_hint } => Self::NotLeader { leader_hint },
            RaftError::ConfigurationConflict { expected, latest } => {
                Self::ConfigurationConflict { expected, latest }
            }
            RaftError::InvalidConfiguration { reason } => Self::InvalidConfiguration { reason },
            RaftError::AlreadyBootstrapped => Self::AlreadyBootstrapped,
            RaftError::Storage(e) => fatal(e),
        }
    }
}

fn fatal(err: impl std::fmt::Display) -> ServerError {
    ServerError::Fatal {
        message: err.to_string(),
    }
}

/// A command that committed and was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied<O> {
    /// Log index the command committed at.
    pub index: LogIndex,
    /// What the state machine returned for it.
    pub output: O,
}

/// The current leader as known to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    /// Leader id.
    pub id: ServerId,
    /// Leader address.
    pub address: String,
}

/// Point-in-time view of a node, published after every actor step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// This node's id.
    pub id: ServerId,
    /// Current role.
    pub state: RaftState,
    /// Current term.
    pub term: TermId,
    /// Known leader, if any.
    pub leader: Option<LeaderInfo>,
    /// Latest configuration in the log.
    pub configuration: Configuration,
    /// Index of the entry that carried `configuration`.
    pub configuration_index: LogIndex,
    /// Highest committed index.
    pub commit_index: LogIndex,
    /// Highest applied index.
    pub last_applied: LogIndex,
    /// Last index covered by the latest snapshot.
    pub snapshot_index: LogIndex,
}

impl NodeStatus {
    /// Returns true if this node is the leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state == RaftState::Leader
    }
}

/// Commands sent to the raft actor.
enum Command<O> {
    Propose {
        data: Bytes,
        reply: oneshot::Sender<Result<Applied<O>, ServerError>>,
    },
    ChangeConfiguration {
        change: ConfigChange,
        expected: LogIndex,
        reply: oneshot::Sender<Result<LogIndex, ServerError>>,
    },
    Bootstrap {
        configuration: Configuration,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    Shutdown,
}

/// An appended entry whose caller is waiting for it to commit.
enum Waiter<O> {
    Proposal {
        term: TermId,
        reply: oneshot::Sender<Result<Applied<O>, ServerError>>,
    },
    Configuration {
        term: TermId,
        reply: oneshot::Sender<Result<LogIndex, ServerError>>,
    },
}

impl<O> Waiter<O> {
    const fn term(&self) -> TermId {
        match self {
            Self::Proposal { term, .. } | Self::Configuration { term, .. } => *term,
        }
    }

    fn fail(self, err: ServerError) {
        // The caller may have given up already.
        match self {
            Self::Proposal { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Configuration { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Handle to interact with a running Raft server.
pub struct ServerHandle<O> {
    commands: mpsc::Sender<Command<O>>,
    status: watch::Receiver<NodeStatus>,
}

impl<O> Clone for ServerHandle<O> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            status: self.status.clone(),
        }
    }
}

impl<O> std::fmt::Debug for ServerHandle<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl<O: Send + 'static> ServerHandle<O> {
    /// Returns the latest published status. Never blocks on the actor.
    #[must_use]
    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// Returns a receiver that observes every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Waits until the status satisfies `predicate`.
    ///
    /// Returns `None` on timeout or if the server stopped.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&NodeStatus) -> bool,
    ) -> Option<NodeStatus> {
        let mut status = self.status.clone();
        let wait = async move {
            status
                .wait_for(|s| predicate(s))
                .await
                .ok()
                .map(|s| (*s).clone())
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Waits until a leader is known.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<LeaderInfo> {
        self.wait_for(timeout, |s| s.leader.is_some())
            .await
            .and_then(|s| s.leader)
    }

    /// Proposes a command and waits until it is applied.
    ///
    /// # Errors
    /// - `NotLeader` if this node is not the leader.
    /// - `CommitTimeout` if the command did not commit within `timeout`.
    /// - `LeadershipLost` if this node stopped leading before commit.
    /// - `ServerUnavailable` or `Fatal` if the server stopped.
    pub async fn propose(&self, data: Bytes, timeout: Duration) -> Result<Applied<O>, ServerError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Propose { data, reply }).await?;
        await_commit(response, timeout).await
    }

    /// Appends a configuration change and waits until it commits.
    ///
    /// `expected` of zero skips the staleness check.
    ///
    /// # Errors
    /// Same as `propose`, plus `ConfigurationConflict` and
    /// `InvalidConfiguration`.
    pub async fn change_configuration(
        &self,
        change: ConfigChange,
        expected: LogIndex,
        timeout: Duration,
    ) -> Result<LogIndex, ServerError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::ChangeConfiguration {
            change,
            expected,
            reply,
        })
        .await?;
        await_commit(response, timeout).await
    }

    /// Seeds a brand-new node with its first configuration.
    ///
    /// # Errors
    /// Returns `AlreadyBootstrapped` if the node has persisted state.
    pub async fn bootstrap(&self, configuration: Configuration) -> Result<(), ServerError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Bootstrap {
            configuration,
            reply,
        })
        .await?;
        response.await.map_err(|_| ServerError::ServerUnavailable)?
    }

    /// Requests the server to shut down.
    ///
    /// # Errors
    /// Returns an error if the server is not available.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command<O>) -> Result<(), ServerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServerError::ServerUnavailable)
    }
}

async fn await_commit<T>(
    response: oneshot::Receiver<Result<T, ServerError>>,
    timeout: Duration,
) -> Result<T, ServerError> {
    match tokio::time::timeout(timeout, response).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ServerError::ServerUnavailable),
        Err(_) => Err(ServerError::CommitTimeout),
    }
}

/// The Raft server.
pub struct RaftServer<S: RaftStorage, F: StateMachine, T: RaftTransport> {
    config: ServerConfig,
    node: RaftNode<S>,
    fsm: F,
    transport: T,
    /// Appended entries with a waiting caller, by index.
    pending: BTreeMap<LogIndex, Waiter<F::Output>>,
    /// Where to send messages for each known server.
    addresses: HashMap<ServerId, String>,
    /// Configuration index the address book was built from.
    membership_index: Option<LogIndex>,
}

impl<S, F, T> RaftServer<S, F, T>
where
    S: RaftStorage + 'static,
    F: StateMachine,
    T: RaftTransport,
{
    /// Creates a server, recovering the node from `storage`.
    ///
    /// The state machine is restored from the latest snapshot, or reset when
    /// there is none, so replaying the log reproduces it exactly.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, storage cannot be
    /// recovered or the state machine cannot be restored.
    pub fn new(config: ServerConfig, storage: S, mut fsm: F, transport: T) -> Result<Self, ServerError> {
        config.validate()?;
        let node = RaftNode::new(config.raft_config(), storage).map_err(fatal)?;

        match node.snapshot() {
            Some(snapshot) => {
                fsm.restore(&snapshot.data).map_err(fatal)?;
                info!(
                    node_id = %config.id,
                    index = snapshot.last_included_index().get(),
                    "Restored state machine from snapshot"
                );
            }
            None => fsm.reset().map_err(fatal)?,
        }

        info!(
            node_id = %config.id,
            term = node.current_term().get(),
            last_index = node.log().last_index().get(),
            "Raft server recovered"
        );

        Ok(Self {
            config,
            node,
            fsm,
            transport,
            pending: BTreeMap::new(),
            addresses: HashMap::new(),
            membership_index: None,
        })
    }

    /// Runs the server, returning a handle for interaction.
    ///
    /// The returned future is the raft actor; spawn it.
    pub fn run(
        self,
        incoming: mpsc::Receiver<IncomingMessage>,
    ) -> (ServerHandle<F::Output>, impl Future<Output = ()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(self.status_snapshot());
        let handle = ServerHandle {
            commands: cmd_tx,
            status: status_rx,
        };

        let future = self.run_loop(cmd_rx, incoming, status_tx);
        (handle, future)
    }

    /// Main server loop.
    async fn run_loop(
        mut self,
        mut commands: mpsc::Receiver<Command<F::Output>>,
        mut incoming: mpsc::Receiver<IncomingMessage>,
        status: watch::Sender<NodeStatus>,
    ) {
        // Single tick timer drives both elections and heartbeats.
        let mut tick_timer = interval(self.config.timing.tick_interval);
        tick_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        self.refresh_membership().await;

        loop {
            let result = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        info!(node_id = %self.config.id, "Raft server shutting down");
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },

                Some(message) = incoming.recv() => self.handle_incoming(message).await,

                _ = tick_timer.tick() => self.handle_tick().await,
            };

            if let Err(e) = result {
                error!(node_id = %self.config.id, error = %e, "Raft server halted");
                self.fail_pending(&e);
                break;
            }

            let next = self.status_snapshot();
            status.send_if_modified(|current| {
                if *current == next {
                    false
                } else {
                    *current = next;
                    true
                }
            });
        }

        self.fail_pending(&ServerError::ServerUnavailable);
    }

    async fn handle_command(&mut self, command: Command<F::Output>) -> Result<(), ServerError> {
        match command {
            Command::Propose { data, reply } => match self.node.propose(data) {
                Ok((index, outputs)) => {
                    let term = self.node.current_term();
                    self.pending.insert(index, Waiter::Proposal { term, reply });
                    self.process_outputs(outputs).await
                }
                Err(e) => reject(e, reply),
            },
            Command::ChangeConfiguration {
                change,
                expected,
                reply,
            } => match self.node.change_configuration(&change, expected) {
                Ok((index, outputs)) => {
                    let term = self.node.current_term();
                    self.pending
                        .insert(index, Waiter::Configuration { term, reply });
                    self.process_outputs(outputs).await
                }
                Err(e) => reject(e, reply),
            },
            Command::Bootstrap {
                configuration,
                reply,
            } => match self.node.bootstrap(configuration) {
                Ok(()) => {
                    let _ = reply.send(Ok(()));
                    self.refresh_membership().await;
                    Ok(())
                }
                Err(e) => reject(e, reply),
            },
            // Handled by the loop.
            Command::Shutdown => Ok(()),
        }
    }

    async fn handle_incoming(&mut self, incoming: IncomingMessage) -> Result<(), ServerError> {
        let IncomingMessage {
            from_address,
            message,
        } = incoming;

        // A fresh joiner learns the leader's address only from its messages.
        self.addresses
            .entry(message.from().clone())
            .or_insert(from_address);

        let outputs = self.node.handle_message(message).map_err(fatal)?;
        self.process_outputs(outputs).await
    }

    async fn handle_tick(&mut self) -> Result<(), ServerError> {
        let outputs = self.node.tick().map_err(fatal)?;
        self.process_outputs(outputs).await
    }

    async fn process_outputs(&mut self, outputs: Vec<RaftOutput>) -> Result<(), ServerError> {
        for output in outputs {
            match output {
                RaftOutput::SendMessage(message) => self.send_message(message).await,
                RaftOutput::CommitEntry(entry) => self.apply_entry(entry)?,
                RaftOutput::RestoreSnapshot(snapshot) => self.restore_snapshot(&snapshot)?,
                RaftOutput::BecameLeader => {
                    debug!(node_id = %self.config.id, "Leadership acquired");
                }
                RaftOutput::SteppedDown => {
                    debug!(
                        node_id = %self.config.id,
                        pending = self.pending.len(),
                        "Leadership lost, failing pending entries"
                    );
                    self.fail_pending(&ServerError::LeadershipLost);
                }
            }
        }

        self.refresh_membership().await;
        self.maybe_snapshot()
    }

    async fn send_message(&self, message: Message) {
        match self.addresses.get(message.to()) {
            Some(address) => self.transport.send(address, message).await,
            None => {
                debug!(
                    node_id = %self.config.id,
                    to = %message.to(),
                    "No address for server, dropping message"
                );
            }
        }
    }

    fn apply_entry(&mut self, entry: LogEntry) -> Result<(), ServerError> {
        let waiter = self.pending.remove(&entry.index);

        // An entry from another term took the index we were waiting on.
        let waiter = match waiter {
            Some(w) if w.term() != entry.term => {
                w.fail(ServerError::LeadershipLost);
                None
            }
            other => other,
        };

        match entry.kind {
            EntryKind::Command => {
                let output = match self.fsm.apply(entry.index, &entry.data) {
                    Ok(output) => output,
                    Err(e) => {
                        let err = fatal(e);
                        if let Some(w) = waiter {
                            w.fail(err.clone());
                        }
                        return Err(err);
                    }
                };
                match waiter {
                    Some(Waiter::Proposal { reply, .. }) => {
                        let _ = reply.send(Ok(Applied {
                            index: entry.index,
                            output,
                        }));
                    }
                    Some(other) => other.fail(ServerError::LeadershipLost),
                    None => {}
                }
            }
            EntryKind::Configuration => match waiter {
                Some(Waiter::Configuration { reply, .. }) => {
                    let _ = reply.send(Ok(entry.index));
                }
                Some(other) => other.fail(ServerError::LeadershipLost),
                None => {}
            },
            EntryKind::Noop => {
                if let Some(w) = waiter {
                    w.fail(ServerError::LeadershipLost);
                }
            }
        }
        Ok(())
    }

    fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), ServerError> {
        let index = snapshot.last_included_index();
        self.fsm.restore(&snapshot.data).map_err(fatal)?;

        // Entries covered by the snapshot will never be delivered one by one.
        let remaining = self.pending.split_off(&index.next());
        for waiter in std::mem::replace(&mut self.pending, remaining).into_values() {
            waiter.fail(ServerError::LeadershipLost);
        }

        info!(
            node_id = %self.config.id,
            index = index.get(),
            term = snapshot.last_included_term().get(),
            bytes = snapshot.data.len(),
            "Installed snapshot into state machine"
        );
        Ok(())
    }

    fn maybe_snapshot(&mut self) -> Result<(), ServerError> {
        let applied = self.node.last_applied().get();
        let base = self.node.log().snapshot_index().get();
        if applied.saturating_sub(base) < self.config.snapshot_threshold {
            return Ok(());
        }

        let data = self.fsm.snapshot().map_err(fatal)?;
        self.node.take_snapshot(data).map_err(fatal)
    }

    /// Rebuilds the address book and trims the connection pool whenever the
    /// latest configuration changes.
    async fn refresh_membership(&mut self) {
        let index = self.node.configuration_index();
        if self.membership_index == Some(index) {
            return;
        }
        self.membership_index = Some(index);

        let mut addresses: HashMap<ServerId, String> = self
            .node
            .configuration()
            .servers()
            .iter()
            .map(|s| (s.id.clone(), s.address.clone()))
            .collect();
        if let Some(leader) = self.node.leader_id() {
            if let Some(address) = self.addresses.get(leader) {
                addresses
                    .entry(leader.clone())
                    .or_insert_with(|| address.clone());
            }
        }
        self.addresses = addresses;

        let own_id = self.node.id();
        let keep: HashSet<String> = self
            .addresses
            .iter()
            .filter(|(id, _)| *id != own_id)
            .map(|(_, address)| address.clone())
            .collect();

        info!(
            node_id = %self.config.id,
            configuration_index = index.get(),
            voters = self.node.configuration().voters().count(),
            non_voters = self.node.configuration().non_voters().count(),
            "Cluster configuration changed"
        );
        if !self.node.configuration().contains(own_id) && !self.node.configuration().is_empty() {
            warn!(node_id = %self.config.id, "This server is not in the latest configuration");
        }

        self.transport.retain(&keep).await;
    }

    fn fail_pending(&mut self, err: &ServerError) {
        for waiter in std::mem::take(&mut self.pending).into_values() {
            waiter.fail(err.clone());
        }
    }

    fn status_snapshot(&self) -> NodeStatus {
        let leader = self.node.leader_id().and_then(|id| {
            let address = self
                .node
                .leader_address()
                .map(str::to_string)
                .or_else(|| self.addresses.get(id).cloned())?;
            Some(LeaderInfo {
                id: id.clone(),
                address,
            })
        });

        NodeStatus {
            id: self.node.id().clone(),
            state: self.node.state(),
            term: self.node.current_term(),
            leader,
            configuration: self.node.configuration().clone(),
            configuration_index: self.node.configuration_index(),
            commit_index: self.node.commit_index(),
            last_applied: self.node.last_applied(),
            snapshot_index: self.node.log().snapshot_index(),
        }
    }

    /// Returns the current role.
    #[must_use]
    pub const fn state(&self) -> RaftState {
        self.node.state()
    }

    /// Returns a reference to the state machine.
    #[must_use]
    pub const fn state_machine(&self) -> &F {
        &self.fsm
    }
}

/// Replies with a rejected operation, or halts on a storage failure.
fn reject<T>(err: RaftError, reply: oneshot::Sender<Result<T, ServerError>>) -> Result<(), ServerError> {
    let halt = matches!(err, RaftError::Storage(_));
    let err = ServerError::from(err);
    let _ = reply.send(Err(err.clone()));
    if halt {
        Err(err)
    } else {
        Ok(())
    }
}
