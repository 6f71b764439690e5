//! Deterministic cluster simulation.
//!
//! Drives `RaftNode`s directly with logical ticks and an in-memory network.
//! Every random choice (message drops, delivery delays, node election seeds)
//! comes from one `ChaCha8Rng`, so a seed replays the same run exactly.
//!
//! Each node applies committed commands to its own `CacheFsm` over a
//! `MemoryStore`, and every applied entry and step is fed to a
//! `PropertyChecker`.
//!
//! Every message is encoded with the transport codec before it is put on
//! the simulated network. A message that does not fit in a frame is dropped,
//! as the TCP transport would, and counted.

use std::collections::{BTreeMap, BTreeSet};

use raftcache_core::{LogIndex, ServerId};
use raftcache_raft::{
    ConfigChange, Configuration, EntryKind, LogEntry, MemoryStorage, Message, RaftConfig,
    RaftError, RaftNode, RaftOutput, RaftResult, RaftState, ServerDescriptor,
};
use raftcache_runtime::{encode_frame, Frame, StateMachine};
use raftcache_server::{CacheFsm, Command, MemoryStore};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::properties::{PropertyChecker, PropertyViolation};

/// Election timeout range used by simulated nodes, in ticks.
pub const ELECTION_TICKS: (u32, u32) = (10, 20);

/// Heartbeat interval used by simulated nodes, in ticks.
pub const HEARTBEAT_TICKS: u32 = 3;

/// Fault and timing knobs for a simulation.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Seed for every random choice.
    pub seed: u64,
    /// Probability that a sent message is lost.
    pub drop_rate: f64,
    /// Upper bound on delivery delay, in ticks (at least 1).
    pub max_delay_ticks: u64,
    /// Take a snapshot once this many entries are applied past the last one.
    pub snapshot_threshold: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            drop_rate: 0.0,
            max_delay_ticks: 2,
            snapshot_threshold: None,
        }
    }
}

impl SimConfig {
    /// Creates a configuration with no faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Sets the message drop probability.
    #[must_use]
    pub const fn with_drop_rate(mut self, drop_rate: f64) -> Self {
        self.drop_rate = drop_rate;
        self
    }

    /// Sets the maximum delivery delay.
    #[must_use]
    pub const fn with_max_delay(mut self, ticks: u64) -> Self {
        self.max_delay_ticks = ticks;
        self
    }

    /// Enables snapshots every `threshold` applied entries.
    #[must_use]
    pub const fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = Some(threshold);
        self
    }
}

struct InFlight {
    deliver_at: u64,
    seq: u64,
    message: Message,
}

/// One simulated server: a live or crashed Raft node plus its cache.
struct SimNode {
    node: Option<RaftNode<MemoryStorage>>,
    /// Durable state kept across a crash.
    crashed: Option<MemoryStorage>,
    fsm: CacheFsm<MemoryStore>,
}

/// A simulated cluster.
pub struct Simulation {
    config: SimConfig,
    rng: ChaCha8Rng,
    now: u64,
    seq: u64,
    nodes: BTreeMap<ServerId, SimNode>,
    in_flight: Vec<InFlight>,
    blocked: BTreeSet<(ServerId, ServerId)>,
    /// Messages dropped because they do not fit in a frame.
    oversized: u64,
    checker: PropertyChecker,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("seed", &self.config.seed)
            .field("now", &self.now)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl Simulation {
    /// Creates an empty simulation.
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            now: 0,
            seq: 0,
            nodes: BTreeMap::new(),
            in_flight: Vec::new(),
            blocked: BTreeSet::new(),
            oversized: 0,
            checker: PropertyChecker::new(),
        }
    }

    /// Creates a cluster where every listed server starts as a voter.
    ///
    /// # Panics
    /// Panics if an id is invalid or listed twice.
    #[must_use]
    pub fn with_voters(config: SimConfig, ids: &[&str]) -> Self {
        let mut sim = Self::new(config);
        let servers = ids
            .iter()
            .map(|id| ServerDescriptor::voter(server_id(id), *id))
            .collect();
        let configuration = Configuration::new(servers).expect("valid configuration");
        for id in ids {
            sim.add_node(id);
            sim.live_mut(id)
                .bootstrap(configuration.clone())
                .expect("fresh node bootstraps");
        }
        sim
    }

    /// Adds a server with no state. It waits for a leader to add it.
    ///
    /// # Panics
    /// Panics if the id is invalid or already used.
    pub fn add_node(&mut self, id: &str) {
        let id = server_id(id);
        assert!(!self.nodes.contains_key(&id), "duplicate node {id}");
        let node = RaftNode::new(self.raft_config(&id), MemoryStorage::new())
            .expect("memory storage cannot fail");
        self.nodes.insert(
            id,
            SimNode {
                node: Some(node),
                crashed: None,
                fsm: CacheFsm::new(MemoryStore::new()),
            },
        );
    }

    fn raft_config(&mut self, id: &ServerId) -> RaftConfig {
        let (min, max) = ELECTION_TICKS;
        RaftConfig::new(id.clone())
            .with_election_ticks(min, max)
            .with_heartbeat_ticks(HEARTBEAT_TICKS)
            .with_seed(self.rng.gen())
    }

    // -------------------------------------------------------------------------
    // Time
    // -------------------------------------------------------------------------

    /// Returns the current logical time.
    #[must_use]
    pub const fn now(&self) -> u64 {
        self.now
    }

    /// Advances one tick: ticks every live node, then delivers due messages.
    pub fn step(&mut self) {
        self.now += 1;

        let live: Vec<ServerId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.node.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        for id in live {
            let outputs = self.live_mut(id.as_str()).tick().expect("tick");
            self.process(&id, outputs);
        }

        let now = self.now;
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.in_flight.drain(..).partition(|m| m.deliver_at <= now);
        self.in_flight = pending;
        due.sort_by_key(|m| (m.deliver_at, m.seq));
        for InFlight { message, .. } in due {
            self.deliver(message);
        }

        let checker = &mut self.checker;
        checker.record_state(self.nodes.values().filter_map(|n| n.node.as_ref()));
    }

    /// Advances `ticks` ticks.
    pub fn run(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Steps until `done` holds, for at most `max_ticks`. Returns whether it
    /// held.
    pub fn run_until(&mut self, max_ticks: u64, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..max_ticks {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Steps until some live node leads with a current-term commit.
    pub fn wait_for_leader(&mut self, max_ticks: u64) -> Option<ServerId> {
        self.run_until(max_ticks, |sim| {
            sim.leader().is_some_and(|id| {
                let node = sim.node(id.as_str()).expect("leader is live");
                node.log().term_at(node.commit_index()) == Some(node.current_term())
            })
        });
        self.leader()
    }

    /// Steps until every listed live node has applied through `index`.
    pub fn wait_for_applied(&mut self, ids: &[&str], index: LogIndex, max_ticks: u64) -> bool {
        self.run_until(max_ticks, |sim| {
            ids.iter()
                .all(|id| sim.node(id).is_some_and(|n| n.last_applied() >= index))
        })
    }

    // -------------------------------------------------------------------------
    // Network
    // -------------------------------------------------------------------------

    fn send(&mut self, message: Message) {
        if self.is_blocked(message.from(), message.to()) {
            return;
        }
        let frame = Frame::Raft {
            from_address: message.from().as_str().to_string(),
            message,
        };
        let encoded = encode_frame(&frame);
        let Frame::Raft { message, .. } = frame else {
            return;
        };
        if let Err(e) = encoded {
            warn!(
                kind = message.kind(),
                from = %message.from(),
                to = %message.to(),
                error = %e,
                "Dropped message that does not fit in a frame"
            );
            self.oversized += 1;
            return;
        }
        if self.config.drop_rate > 0.0 && self.rng.gen_bool(self.config.drop_rate) {
            debug!(from = %message.from(), to = %message.to(), "Dropped message");
            return;
        }
        let delay = self.rng.gen_range(1..=self.config.max_delay_ticks.max(1));
        self.seq += 1;
        self.in_flight.push(InFlight {
            deliver_at: self.now + delay,
            seq: self.seq,
            message,
        });
    }

    fn deliver(&mut self, message: Message) {
        let to = message.to().clone();
        if self.is_blocked(message.from(), &to) {
            return;
        }
        let Some(node) = self.nodes.get_mut(&to).and_then(|n| n.node.as_mut()) else {
            return;
        };
        let outputs = node.handle_message(message).expect("handle message");
        self.process(&to, outputs);
    }

    fn is_blocked(&self, from: &ServerId, to: &ServerId) -> bool {
        self.blocked.contains(&(from.clone(), to.clone()))
    }

    /// Cuts every link between the two groups, in both directions.
    pub fn partition(&mut self, left: &[&str], right: &[&str]) {
        for a in left {
            for b in right {
                let (a, b) = (server_id(a), server_id(b));
                self.blocked.insert((a.clone(), b.clone()));
                self.blocked.insert((b, a));
            }
        }
        info!(?left, ?right, tick = self.now, "Partitioned");
    }

    /// Isolates one server from every other.
    pub fn isolate(&mut self, id: &str) {
        let others: Vec<String> = self
            .nodes
            .keys()
            .filter(|other| other.as_str() != id)
            .map(|other| other.as_str().to_string())
            .collect();
        let others: Vec<&str> = others.iter().map(String::as_str).collect();
        self.partition(&[id], &others);
    }

    /// Restores every link.
    pub fn heal(&mut self) {
        self.blocked.clear();
        info!(tick = self.now, "Healed partitions");
    }

    // -------------------------------------------------------------------------
    // Outputs
    // -------------------------------------------------------------------------

    fn process(&mut self, id: &ServerId, outputs: Vec<RaftOutput>) {
        for output in outputs {
            match output {
                RaftOutput::SendMessage(message) => self.send(message),
                RaftOutput::CommitEntry(entry) => self.apply(id, &entry),
                RaftOutput::RestoreSnapshot(snapshot) => {
                    let sim_node = self.nodes.get_mut(id).expect("known node");
                    sim_node.fsm.restore(&snapshot.data).expect("restore");
                    debug!(
                        node_id = %id,
                        index = snapshot.last_included_index().get(),
                        "Restored snapshot"
                    );
                }
                RaftOutput::BecameLeader | RaftOutput::SteppedDown => {}
            }
        }
        self.maybe_snapshot(id);
    }

    fn apply(&mut self, id: &ServerId, entry: &LogEntry) {
        if entry.kind != EntryKind::Command {
            return;
        }
        let sim_node = self.nodes.get_mut(id).expect("known node");
        // Per-command failures are outcomes, only undecodable data is fatal.
        let _outcome = sim_node.fsm.apply(entry.index, &entry.data).expect("apply");
        self.checker.record_applied(id.as_str(), entry);
    }

    fn maybe_snapshot(&mut self, id: &ServerId) {
        let Some(threshold) = self.config.snapshot_threshold else {
            return;
        };
        let Some(sim_node) = self.nodes.get_mut(id) else {
            return;
        };
        let Some(node) = sim_node.node.as_mut() else {
            return;
        };
        let pending = node.last_applied().get() - node.log().snapshot_index().get();
        if pending < threshold {
            return;
        }
        let data = sim_node.fsm.snapshot().expect("snapshot");
        node.take_snapshot(data).expect("take snapshot");
    }

    // -------------------------------------------------------------------------
    // Client Operations
    // -------------------------------------------------------------------------

    /// Proposes a command on the current leader.
    ///
    /// Returns the index it was appended at, or `None` without a leader.
    pub fn propose(&mut self, command: &Command) -> Option<LogIndex> {
        let leader = self.leader()?;
        self.propose_on(leader.as_str(), command)
    }

    /// Proposes a command on one server, which may be a stale leader.
    ///
    /// # Panics
    /// Panics if the server is not live.
    pub fn propose_on(&mut self, id: &str, command: &Command) -> Option<LogIndex> {
        let result = self.live_mut(id).propose(command.encode());
        match result {
            Ok((index, outputs)) => {
                self.process(&server_id(id), outputs);
                Some(index)
            }
            Err(e) => {
                debug!(error = %e, "Proposal rejected");
                None
            }
        }
    }

    /// Appends a configuration change on the current leader.
    ///
    /// # Errors
    /// Returns `NotLeader` without a leader, or the leader's rejection.
    pub fn change_configuration(
        &mut self,
        change: &ConfigChange,
        expected_index: LogIndex,
    ) -> RaftResult<LogIndex> {
        let leader = self
            .leader()
            .ok_or(RaftError::NotLeader { leader_hint: None })?;
        let (index, outputs) = self
            .live_mut(leader.as_str())
            .change_configuration(change, expected_index)?;
        self.process(&leader, outputs);
        Ok(index)
    }

    // -------------------------------------------------------------------------
    // Faults
    // -------------------------------------------------------------------------

    /// Stops a server, keeping only its durable storage.
    pub fn crash(&mut self, id: &str) {
        let sim_node = self.nodes.get_mut(&server_id(id)).expect("known node");
        if let Some(node) = sim_node.node.take() {
            sim_node.crashed = Some(node.into_storage());
            info!(node_id = id, tick = self.now, "Crashed");
        }
    }

    /// Restarts a crashed server from its storage.
    ///
    /// The cache is rebuilt from the latest snapshot; later entries are
    /// applied again as the node learns they are committed.
    pub fn restart(&mut self, id: &str) {
        let server = server_id(id);
        let Some(storage) = self.nodes.get_mut(&server).and_then(|n| n.crashed.take()) else {
            return;
        };
        let config = self.raft_config(&server);
        let node = RaftNode::new(config, storage).expect("recover from memory storage");

        let sim_node = self.nodes.get_mut(&server).expect("known node");
        sim_node.fsm.reset().expect("reset");
        if let Some(snapshot) = node.snapshot() {
            sim_node.fsm.restore(&snapshot.data).expect("restore");
        }
        sim_node.node = Some(node);
        info!(node_id = id, tick = self.now, "Restarted");
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Returns the live leader with the highest term.
    #[must_use]
    pub fn leader(&self) -> Option<ServerId> {
        self.live_nodes()
            .filter(|n| n.state() == RaftState::Leader)
            .max_by_key(|n| n.current_term())
            .map(|n| n.id().clone())
    }

    /// Returns a live node.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&RaftNode<MemoryStorage>> {
        self.nodes
            .get(&server_id(id))
            .and_then(|n| n.node.as_ref())
    }

    /// Iterates the live nodes.
    pub fn live_nodes(&self) -> impl Iterator<Item = &RaftNode<MemoryStorage>> {
        self.nodes.values().filter_map(|n| n.node.as_ref())
    }

    /// Reads a key from one server's cache.
    ///
    /// # Panics
    /// Panics if the server is unknown.
    #[must_use]
    pub fn get(&self, id: &str, bucket: &str, key: &str) -> Option<String> {
        self.nodes[&server_id(id)]
            .fsm
            .get(bucket, key)
            .expect("memory store read")
    }

    /// Runs every property check on the live nodes and returns all
    /// violations found during the run.
    pub fn check(&mut self) -> Vec<PropertyViolation> {
        let nodes: Vec<&RaftNode<MemoryStorage>> =
            self.nodes.values().filter_map(|n| n.node.as_ref()).collect();
        self.checker.check_all(nodes).to_vec()
    }

    /// Returns how many messages were dropped for not fitting in a frame.
    #[must_use]
    pub const fn oversized_frames(&self) -> u64 {
        self.oversized
    }

    /// Panics with every violation found so far.
    ///
    /// # Panics
    /// Panics if any safety property was violated or any message did not
    /// fit in a frame.
    pub fn assert_safe(&mut self) {
        assert_eq!(
            self.oversized, 0,
            "seed {}: messages dropped for exceeding the frame limit",
            self.config.seed
        );
        let violations = self.check();
        assert!(
            violations.is_empty(),
            "seed {}: {}",
            self.config.seed,
            violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        );
    }

    /// Returns the property checker.
    #[must_use]
    pub const fn checker(&self) -> &PropertyChecker {
        &self.checker
    }

    fn live_mut(&mut self, id: &str) -> &mut RaftNode<MemoryStorage> {
        self.nodes
            .get_mut(&server_id(id))
            .and_then(|n| n.node.as_mut())
            .expect("node is live")
    }
}

/// Builds a `Set` command.
#[must_use]
pub fn set(bucket: &str, key: &str, value: &str) -> Command {
    Command::Set {
        bucket: bucket.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Builds a `CreateBucket` command.
#[must_use]
pub fn create_bucket(bucket: &str) -> Command {
    Command::CreateBucket {
        bucket: bucket.to_string(),
    }
}

fn server_id(id: &str) -> ServerId {
    ServerId::new(id).expect("valid server id")
}
