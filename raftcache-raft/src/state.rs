//! Raft state machine implementation.
//!
//! `RaftNode` is driven by three inputs: `tick`, `handle_message` and the
//! leader-only `propose` / `change_configuration`. Each returns the outputs
//! the caller must act on. Term, vote and log changes are written through
//! `RaftStorage` before the outputs that depend on them are returned, so the
//! caller may send messages as soon as it receives them.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use raftcache_core::{LogIndex, ServerId, TermId};
use tracing::{debug, error, info, warn};

use crate::config::RaftConfig;
use crate::error::{RaftError, RaftResult};
use crate::log::{EntryKind, LogEntry, RaftLog};
use crate::membership::{ConfigChange, Configuration};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    Message, RequestVoteRequest, RequestVoteResponse,
};
use crate::snapshot::{Snapshot, SnapshotMeta, SNAPSHOT_SIZE_MAX};
use crate::storage::{PersistentState, RaftStorage, StorageError, StorageResult};

/// Raft node state (role).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaftState {
    /// Follower state - passive, responds to RPCs.
    #[default]
    Follower,
    /// Candidate state - actively seeking votes.
    Candidate,
    /// Leader state - handles client requests, replicates log.
    Leader,
}

impl RaftState {
    /// Returns the lowercase role name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Follower => "follower",
            Self::Candidate => "candidate",
            Self::Leader => "leader",
        }
    }
}

impl std::fmt::Display for RaftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output actions from the Raft state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftOutput {
    /// Send a message to another server.
    SendMessage(Message),
    /// An entry has been committed. Delivered exactly once, in index order.
    CommitEntry(LogEntry),
    /// Replace the state machine with this snapshot before applying any
    /// later `CommitEntry`.
    RestoreSnapshot(Snapshot),
    /// This node became leader.
    BecameLeader,
    /// This node stopped being leader.
    SteppedDown,
}

/// Leader's view of one follower's log.
#[derive(Debug, Clone, Copy)]
struct Progress {
    /// Index of the next entry to send.
    next_index: LogIndex,
    /// Highest index known to be stored on the follower.
    match_index: LogIndex,
    /// Snapshot being streamed to the follower, if any.
    snapshot: Option<SnapshotTransfer>,
}

/// Leader-side position in a snapshot being streamed to one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SnapshotTransfer {
    /// Last index covered by the snapshot being sent.
    index: LogIndex,
    /// Offset of the next chunk to send.
    offset: u64,
}

/// Follower-side snapshot being received in chunks.
#[derive(Debug)]
struct IncomingSnapshot {
    meta: SnapshotMeta,
    checksum: u32,
    data: BytesMut,
}

impl IncomingSnapshot {
    /// True if `req` carries a chunk of this snapshot.
    fn matches(&self, req: &InstallSnapshotRequest) -> bool {
        self.meta.last_included_index == req.meta.last_included_index
            && self.meta.last_included_term == req.meta.last_included_term
            && self.checksum == req.checksum
    }

    fn received(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A Raft consensus node.
///
/// This is a pure state machine apart from writes through its storage: it
/// takes inputs and produces outputs but performs no network I/O and reads
/// no clock. This enables deterministic simulation testing.
#[derive(Debug)]
pub struct RaftNode<S: RaftStorage> {
    config: RaftConfig,
    storage: S,
    rng: StdRng,

    // Persistent state, mirrored in storage.
    current_term: TermId,
    voted_for: Option<ServerId>,
    log: RaftLog,
    snapshot: Option<Snapshot>,
    /// Snapshot chunks received so far from the leader.
    incoming_snapshot: Option<IncomingSnapshot>,

    // Volatile state on all servers.
    state: RaftState,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_id: Option<ServerId>,

    /// Latest configuration in the log, in effect as soon as it is appended.
    configuration: Configuration,
    configuration_index: LogIndex,
    /// Configuration that preceded `configuration`.
    previous_configuration: Configuration,
    previous_configuration_index: LogIndex,

    // Volatile state on leaders (reinitialized after election).
    progress: BTreeMap<ServerId, Progress>,
    /// Servers heard from since the last quorum check.
    recent_active: BTreeSet<ServerId>,

    // Candidate state.
    votes_received: BTreeSet<ServerId>,

    // Timers, in ticks.
    election_elapsed: u32,
    randomized_election_timeout: u32,
    heartbeat_elapsed: u32,
    check_quorum_elapsed: u32,
}

impl<S: RaftStorage> RaftNode<S> {
    /// Creates a node, recovering term, vote, snapshot and log from storage.
    ///
    /// # Errors
    /// Returns an error if storage cannot be read or the log has a gap.
    pub fn new(config: RaftConfig, storage: S) -> StorageResult<Self> {
        let persistent = storage.load_state()?.unwrap_or_default();
        let snapshot = storage.load_snapshot()?;

        let mut log = snapshot.as_ref().map_or_else(RaftLog::new, |s| {
            RaftLog::with_snapshot(s.last_included_index(), s.last_included_term())
        });
        for entry in storage.load_entries()? {
            let expected = log.last_index().next();
            if entry.index != expected {
                return Err(StorageError::Corruption {
                    message: format!(
                        "log gap: expected index {}, found {}",
                        expected.get(),
                        entry.index.get()
                    ),
                });
            }
            log.append(entry);
        }

        let base = log.snapshot_index();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let randomized_election_timeout =
            rng.gen_range(config.election_timeout_min_ticks..=config.election_timeout_max_ticks);

        let mut node = Self {
            config,
            storage,
            rng,
            current_term: persistent.current_term,
            voted_for: persistent.voted_for,
            log,
            snapshot,
            incoming_snapshot: None,
            state: RaftState::Follower,
            commit_index: base,
            last_applied: base,
            leader_id: None,
            configuration: Configuration::empty(),
            configuration_index: LogIndex::new(0),
            previous_configuration: Configuration::empty(),
            previous_configuration_index: LogIndex::new(0),
            progress: BTreeMap::new(),
            recent_active: BTreeSet::new(),
            votes_received: BTreeSet::new(),
            election_elapsed: 0,
            randomized_election_timeout,
            heartbeat_elapsed: 0,
            check_quorum_elapsed: 0,
        };
        node.reload_configuration();

        info!(
            node_id = %node.config.id,
            term = node.current_term.get(),
            last_index = node.log.last_index().get(),
            snapshot_index = base.get(),
            voters = node.configuration.voters().count(),
            "Raft node recovered"
        );
        Ok(node)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Returns this node's ID.
    #[must_use]
    pub const fn id(&self) -> &ServerId {
        &self.config.id
    }

    /// Returns the current term.
    #[must_use]
    pub const fn current_term(&self) -> TermId {
        self.current_term
    }

    /// Returns who this node voted for in the current term.
    #[must_use]
    pub const fn voted_for(&self) -> Option<&ServerId> {
        self.voted_for.as_ref()
    }

    /// Returns the current state (role).
    #[must_use]
    pub const fn state(&self) -> RaftState {
        self.state
    }

    /// Returns true if this node is the leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state == RaftState::Leader
    }

    /// Returns the current leader ID if known.
    #[must_use]
    pub const fn leader_id(&self) -> Option<&ServerId> {
        self.leader_id.as_ref()
    }

    /// Returns the current leader's address if known.
    #[must_use]
    pub fn leader_address(&self) -> Option<&str> {
        self.leader_id
            .as_ref()
            .and_then(|id| self.configuration.address_of(id))
    }

    /// Returns the commit index.
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Returns the last index handed out as `CommitEntry` or covered by a
    /// restored snapshot.
    #[must_use]
    pub const fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Returns a reference to the log.
    #[must_use]
    pub const fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Returns the latest configuration.
    #[must_use]
    pub const fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Returns the index of the entry that carried the latest configuration.
    #[must_use]
    pub const fn configuration_index(&self) -> LogIndex {
        self.configuration_index
    }

    /// Returns the latest snapshot, if any.
    #[must_use]
    pub const fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Returns the storage.
    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// Consumes the node, returning its storage.
    ///
    /// Used to simulate a crash: everything not in storage is lost.
    #[must_use]
    pub fn into_storage(self) -> S {
        self.storage
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    /// Seeds a brand-new node with its first configuration.
    ///
    /// Writes a configuration entry at index 1, term 1. The node then elects
    /// itself (or one of the listed voters) through the normal timeout.
    ///
    /// # Errors
    /// Returns `AlreadyBootstrapped` if any state was persisted before, or
    /// `InvalidConfiguration` if the configuration has no voters.
    pub fn bootstrap(&mut self, configuration: Configuration) -> RaftResult<()> {
        if self.current_term.get() > 0
            || self.log.last_index().get() > 0
            || self.storage.has_existing_state()?
        {
            return Err(RaftError::AlreadyBootstrapped);
        }
        if configuration.voters().next().is_none() {
            return Err(RaftError::InvalidConfiguration {
                reason: "bootstrap configuration needs at least one voter".to_string(),
            });
        }

        let term = TermId::new(1);
        self.current_term = term;
        self.voted_for = None;
        self.persist_state()?;
        self.append_local(vec![LogEntry::configuration(
            term,
            LogIndex::new(1),
            &configuration,
        )])?;

        info!(
            node_id = %self.config.id,
            voters = configuration.voters().count(),
            "Bootstrapped cluster configuration"
        );
        Ok(())
    }

    /// Advances logical time by one tick.
    ///
    /// # Errors
    /// Returns an error if starting an election cannot persist the new term.
    pub fn tick(&mut self) -> StorageResult<Vec<RaftOutput>> {
        if self.state == RaftState::Leader {
            return Ok(self.tick_leader());
        }

        self.election_elapsed = self.election_elapsed.saturating_add(1);
        if self.election_elapsed < self.randomized_election_timeout {
            return Ok(Vec::new());
        }

        if self.configuration.is_voter(&self.config.id) {
            return self.campaign();
        }
        // Non-voters and servers outside the configuration never campaign.
        self.reset_election_timer();
        Ok(Vec::new())
    }

    /// Proposes a command (leader only).
    ///
    /// Returns the index the command was appended at. The entry is committed
    /// later, when a `CommitEntry` output carries it.
    ///
    /// # Errors
    /// Returns `NotLeader` if this node is not the leader, or a storage error.
    pub fn propose(&mut self, data: Bytes) -> RaftResult<(LogIndex, Vec<RaftOutput>)> {
        if self.state != RaftState::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id.clone(),
            });
        }

        let index = self.log.last_index().next();
        self.append_local(vec![LogEntry::new(self.current_term, index, data)])?;

        let mut outputs = self.broadcast_append();
        outputs.extend(self.maybe_commit());
        Ok((index, outputs))
    }

    /// Appends a single-server configuration change (leader only).
    ///
    /// `expected_index` of 0 means "whatever the latest configuration is";
    /// any other value must equal the latest configuration index.
    ///
    /// # Errors
    /// - `NotLeader` if this node is not the leader.
    /// - `ConfigurationConflict` if `expected_index` is stale, a change is
    ///   still uncommitted, or no entry of this leader's term has committed.
    /// - `InvalidConfiguration` if the change would leave no voters.
    pub fn change_configuration(
        &mut self,
        change: &ConfigChange,
        expected_index: LogIndex,
    ) -> RaftResult<(LogIndex, Vec<RaftOutput>)> {
        if self.state != RaftState::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id.clone(),
            });
        }

        let conflict = RaftError::ConfigurationConflict {
            expected: expected_index,
            latest: self.configuration_index,
        };
        if expected_index.get() != 0 && expected_index != self.configuration_index {
            return Err(conflict);
        }
        if self.configuration_index > self.commit_index {
            return Err(conflict);
        }
        if self.log.term_at(self.commit_index) != Some(self.current_term) {
            return Err(conflict);
        }

        let next = self.configuration.apply(change)?;
        let index = self.log.last_index().next();
        self.append_local(vec![LogEntry::configuration(self.current_term, index, &next)])?;

        info!(
            node_id = %self.config.id,
            term = self.current_term.get(),
            index = index.get(),
            change = ?change,
            "Appended configuration change"
        );

        let mut outputs = self.broadcast_append();
        outputs.extend(self.maybe_commit());
        Ok((index, outputs))
    }

    /// Handles an incoming message.
    ///
    /// # Errors
    /// Returns an error if storage fails. The node must not be used after.
    pub fn handle_message(&mut self, message: Message) -> StorageResult<Vec<RaftOutput>> {
        if message.to() != &self.config.id {
            debug!(
                node_id = %self.config.id,
                to = %message.to(),
                "Dropping message addressed to another server"
            );
            return Ok(Vec::new());
        }

        let mut outputs = Vec::new();
        let term = message.term();
        if term > self.current_term {
            // A server that still hears from a leader ignores candidates, so a
            // removed or partitioned server cannot force needless elections.
            if matches!(message, Message::RequestVote(_)) && self.in_leader_lease() {
                debug!(
                    node_id = %self.config.id,
                    from = %message.from(),
                    term = term.get(),
                    "Ignoring vote request while leader is active"
                );
                return Ok(outputs);
            }
            outputs.extend(self.step_down(term)?);
        }

        match message {
            Message::RequestVote(req) => outputs.extend(self.handle_request_vote(&req)?),
            Message::RequestVoteResponse(resp) => {
                outputs.extend(self.handle_request_vote_response(&resp)?);
            }
            Message::AppendEntries(req) => outputs.extend(self.handle_append_entries(req)?),
            Message::AppendEntriesResponse(resp) => {
                outputs.extend(self.handle_append_entries_response(&resp));
            }
            Message::InstallSnapshot(req) => outputs.extend(self.handle_install_snapshot(req)?),
            Message::InstallSnapshotResponse(resp) => {
                outputs.extend(self.handle_install_snapshot_response(&resp));
            }
        }
        Ok(outputs)
    }

    /// Records a snapshot of the state machine at `last_applied` and
    /// compacts the log up to it.
    ///
    /// `data` must be the state machine image after applying every entry up
    /// to `last_applied`.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be persisted.
    pub fn take_snapshot(&mut self, data: Bytes) -> StorageResult<()> {
        let index = self.last_applied;
        if index <= self.log.snapshot_index() {
            return Ok(());
        }
        let term = self
            .log
            .term_at(index)
            .ok_or(StorageError::NotFound { index })?;

        let (configuration, configuration_index) = self.configuration_entry_at(index);
        let meta = SnapshotMeta {
            last_included_index: index,
            last_included_term: term,
            configuration: configuration.into_owned(),
            configuration_index,
        };
        let snapshot = Snapshot::new(meta, data);

        self.storage.save_snapshot(&snapshot)?;
        self.log.compact_to(index, term);
        self.snapshot = Some(snapshot);
        self.reload_configuration();

        info!(
            node_id = %self.config.id,
            index = index.get(),
            term = term.get(),
            remaining_entries = self.log.len(),
            "Took snapshot"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Timers and roles
    // -------------------------------------------------------------------------

    fn tick_leader(&mut self) -> Vec<RaftOutput> {
        self.heartbeat_elapsed = self.heartbeat_elapsed.saturating_add(1);
        self.check_quorum_elapsed = self.check_quorum_elapsed.saturating_add(1);

        if self.check_quorum_elapsed >= self.config.election_timeout_max_ticks {
            self.check_quorum_elapsed = 0;
            let id = &self.config.id;
            let active = &self.recent_active;
            let has_quorum = self
                .configuration
                .has_quorum(|s| s == id || active.contains(s));
            self.recent_active.clear();
            if !has_quorum {
                warn!(
                    node_id = %self.config.id,
                    term = self.current_term.get(),
                    "Lost contact with a quorum, stepping down"
                );
                return self.become_follower(None);
            }
        }

        if self.heartbeat_elapsed >= self.config.heartbeat_ticks {
            self.heartbeat_elapsed = 0;
            return self.broadcast_append();
        }
        Vec::new()
    }

    fn in_leader_lease(&self) -> bool {
        self.state == RaftState::Leader
            || (self.leader_id.is_some()
                && self.election_elapsed < self.config.election_timeout_min_ticks)
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.randomized_election_timeout = self.rng.gen_range(
            self.config.election_timeout_min_ticks..=self.config.election_timeout_max_ticks,
        );
    }

    fn persist_state(&mut self) -> StorageResult<()> {
        self.storage.save_state(&PersistentState::new(
            self.current_term,
            self.voted_for.clone(),
        ))
    }

    /// Adopts a newer term and becomes follower.
    fn step_down(&mut self, term: TermId) -> StorageResult<Vec<RaftOutput>> {
        debug_assert!(term > self.current_term);

        self.current_term = term;
        self.voted_for = None;
        self.persist_state()?;
        Ok(self.become_follower(None))
    }

    fn become_follower(&mut self, leader: Option<ServerId>) -> Vec<RaftOutput> {
        let was_leader = self.state == RaftState::Leader;

        self.state = RaftState::Follower;
        self.leader_id = leader;
        self.votes_received.clear();
        self.progress.clear();
        self.recent_active.clear();

        if was_leader {
            info!(
                node_id = %self.config.id,
                term = self.current_term.get(),
                "Stepped down from leader"
            );
            vec![RaftOutput::SteppedDown]
        } else {
            Vec::new()
        }
    }

    fn campaign(&mut self) -> StorageResult<Vec<RaftOutput>> {
        let prev_term = self.current_term;

        self.state = RaftState::Candidate;
        self.current_term = self.current_term.next();
        self.voted_for = Some(self.config.id.clone());
        self.leader_id = None;
        self.persist_state()?;

        self.votes_received.clear();
        self.votes_received.insert(self.config.id.clone());
        self.reset_election_timer();

        // Postcondition: term incremented, we voted for ourselves.
        debug_assert!(self.current_term.get() == prev_term.get() + 1);

        info!(
            node_id = %self.config.id,
            term = self.current_term.get(),
            last_index = self.log.last_index().get(),
            "Starting election"
        );

        let votes = &self.votes_received;
        if self.configuration.has_quorum(|s| votes.contains(s)) {
            return self.become_leader();
        }

        let mut outputs = Vec::new();
        for voter in self.configuration.voters() {
            if voter.id == self.config.id {
                continue;
            }
            outputs.push(RaftOutput::SendMessage(Message::RequestVote(
                RequestVoteRequest {
                    term: self.current_term,
                    candidate_id: self.config.id.clone(),
                    to: voter.id.clone(),
                    last_log_index: self.log.last_index(),
                    last_log_term: self.log.last_term(),
                },
            )));
        }
        Ok(outputs)
    }

    fn become_leader(&mut self) -> StorageResult<Vec<RaftOutput>> {
        debug_assert!(self.state == RaftState::Candidate);

        self.state = RaftState::Leader;
        self.leader_id = Some(self.config.id.clone());
        self.heartbeat_elapsed = 0;
        self.check_quorum_elapsed = 0;
        self.recent_active.clear();
        self.progress.clear();
        self.sync_progress();

        info!(
            node_id = %self.config.id,
            term = self.current_term.get(),
            last_index = self.log.last_index().get(),
            "Became leader"
        );

        let mut outputs = vec![RaftOutput::BecameLeader];

        // Committing an entry of our own term commits everything before it.
        let noop = LogEntry::noop(self.current_term, self.log.last_index().next());
        self.append_local(vec![noop])?;

        outputs.extend(self.broadcast_append());
        outputs.extend(self.maybe_commit());
        Ok(outputs)
    }

    // -------------------------------------------------------------------------
    // Elections
    // -------------------------------------------------------------------------

    fn handle_request_vote(&mut self, req: &RequestVoteRequest) -> StorageResult<Vec<RaftOutput>> {
        let can_vote = self
            .voted_for
            .as_ref()
            .map_or(true, |v| v == &req.candidate_id);
        let vote_granted = req.term == self.current_term
            && can_vote
            && self.log.is_up_to_date(req.last_log_term, req.last_log_index);

        if vote_granted {
            if self.voted_for.is_none() {
                self.voted_for = Some(req.candidate_id.clone());
                self.persist_state()?;
            }
            self.reset_election_timer();
            debug!(
                node_id = %self.config.id,
                candidate = %req.candidate_id,
                term = self.current_term.get(),
                "Granted vote"
            );
        }

        Ok(vec![RaftOutput::SendMessage(Message::RequestVoteResponse(
            RequestVoteResponse {
                term: self.current_term,
                from: self.config.id.clone(),
                to: req.candidate_id.clone(),
                vote_granted,
            },
        ))])
    }

    fn handle_request_vote_response(
        &mut self,
        resp: &RequestVoteResponse,
    ) -> StorageResult<Vec<RaftOutput>> {
        if self.state != RaftState::Candidate || resp.term != self.current_term {
            return Ok(Vec::new());
        }
        if !resp.vote_granted || !self.configuration.is_voter(&resp.from) {
            return Ok(Vec::new());
        }

        self.votes_received.insert(resp.from.clone());
        let votes = &self.votes_received;
        if self.configuration.has_quorum(|s| votes.contains(s)) {
            return self.become_leader();
        }
        Ok(Vec::new())
    }

    // -------------------------------------------------------------------------
    // Replication (follower side)
    // -------------------------------------------------------------------------

    fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
    ) -> StorageResult<Vec<RaftOutput>> {
        if req.term < self.current_term {
            return Ok(vec![self.append_response(&req.leader_id, false, self.log.last_index())]);
        }

        // Valid leader for our term.
        let mut outputs = Vec::new();
        if self.state != RaftState::Follower || self.leader_id.as_ref() != Some(&req.leader_id) {
            outputs.extend(self.become_follower(Some(req.leader_id.clone())));
        }
        self.reset_election_timer();

        let prev_ok = req.prev_log_index <= self.log.snapshot_index()
            || self.log.term_at(req.prev_log_index) == Some(req.prev_log_term);
        if !prev_ok {
            let hint = self.conflict_hint(req.prev_log_index);
            debug!(
                node_id = %self.config.id,
                prev_index = req.prev_log_index.get(),
                hint = hint.get(),
                "Rejecting append: log mismatch"
            );
            outputs.push(self.append_response(&req.leader_id, false, hint));
            return Ok(outputs);
        }

        let count = req.entries.len() as u64;
        let last_new_index = LogIndex::new(req.prev_log_index.get() + count);
        let (position, conflict) = self.log.find_conflict(&req.entries);

        if let Some(from) = conflict {
            if from <= self.commit_index {
                error!(
                    node_id = %self.config.id,
                    index = from.get(),
                    commit_index = self.commit_index.get(),
                    "Leader sent an entry conflicting with a committed entry"
                );
                return Err(StorageError::Corruption {
                    message: format!("conflict at committed index {}", from.get()),
                });
            }
            debug!(
                node_id = %self.config.id,
                from = from.get(),
                "Truncating conflicting log suffix"
            );
            self.storage.truncate_after(from.prev())?;
            self.log.truncate_after(from.prev());
            self.reload_configuration();
        }

        let mut entries = req.entries;
        let new_entries = entries.split_off(position);
        if !new_entries.is_empty() {
            self.append_local(new_entries)?;
        }

        if req.leader_commit > self.commit_index {
            let new_commit = req.leader_commit.min(last_new_index);
            outputs.extend(self.advance_commit(new_commit));
        }

        outputs.push(self.append_response(&req.leader_id, true, last_new_index));
        Ok(outputs)
    }

    /// Returns the highest index the leader might still share with us when
    /// `prev` did not match.
    fn conflict_hint(&self, prev: LogIndex) -> LogIndex {
        if prev > self.log.last_index() {
            return self.log.last_index();
        }
        let Some(term) = self.log.term_at(prev) else {
            return self.log.snapshot_index();
        };

        // Skip back over the whole conflicting term.
        let mut index = prev;
        while index > self.log.snapshot_index() && self.log.term_at(index.prev()) == Some(term) {
            index = index.prev();
        }
        index.prev().max(self.log.snapshot_index())
    }

    fn append_response(&self, leader: &ServerId, success: bool, index: LogIndex) -> RaftOutput {
        RaftOutput::SendMessage(Message::AppendEntriesResponse(AppendEntriesResponse {
            term: self.current_term,
            from: self.config.id.clone(),
            to: leader.clone(),
            success,
            match_index: index,
        }))
    }

    /// Accepts one snapshot chunk, installing the snapshot after the last.
    fn handle_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> StorageResult<Vec<RaftOutput>> {
        let index = req.last_included_index();
        let respond = |node: &Self, next_offset: u64, done: bool, success: bool| {
            RaftOutput::SendMessage(Message::InstallSnapshotResponse(InstallSnapshotResponse {
                term: node.current_term,
                from: node.config.id.clone(),
                to: req.leader_id.clone(),
                last_included_index: index,
                next_offset,
                done,
                success,
            }))
        };

        if req.term < self.current_term {
            return Ok(vec![respond(self, 0, false, false)]);
        }

        let mut outputs = Vec::new();
        if self.state != RaftState::Follower || self.leader_id.as_ref() != Some(&req.leader_id) {
            outputs.extend(self.become_follower(Some(req.leader_id.clone())));
        }
        self.reset_election_timer();

        let chunk_end = req.offset.saturating_add(req.data.len() as u64);
        if index <= self.commit_index {
            self.incoming_snapshot = None;
            outputs.push(respond(self, chunk_end, true, true));
            return Ok(outputs);
        }

        if req.offset == 0
            && !self
                .incoming_snapshot
                .as_ref()
                .is_some_and(|incoming| incoming.matches(&req))
        {
            self.incoming_snapshot = Some(IncomingSnapshot {
                meta: req.meta.clone(),
                checksum: req.checksum,
                data: BytesMut::new(),
            });
        }
        let Some(incoming) = self
            .incoming_snapshot
            .as_mut()
            .filter(|incoming| incoming.matches(&req))
        else {
            // A chunk of a snapshot we never saw the start of.
            outputs.push(respond(self, 0, false, false));
            return Ok(outputs);
        };

        let received = incoming.received();
        if req.offset != received {
            // A repeated chunk is acknowledged; a gap is not.
            let duplicate = req.offset < received;
            outputs.push(respond(self, received, false, duplicate));
            return Ok(outputs);
        }
        if chunk_end > SNAPSHOT_SIZE_MAX {
            warn!(
                node_id = %self.config.id,
                index = index.get(),
                bytes = chunk_end,
                "Rejecting snapshot over the size limit"
            );
            self.incoming_snapshot = None;
            outputs.push(respond(self, 0, false, false));
            return Ok(outputs);
        }
        incoming.data.extend_from_slice(&req.data);

        if !req.done {
            outputs.push(respond(self, chunk_end, false, true));
            return Ok(outputs);
        }

        let Some(incoming) = self.incoming_snapshot.take() else {
            return Ok(outputs);
        };
        let snapshot = Snapshot {
            meta: incoming.meta,
            data: incoming.data.freeze(),
            checksum: incoming.checksum,
        };
        if !snapshot.verify_checksum() {
            warn!(
                node_id = %self.config.id,
                index = index.get(),
                bytes = snapshot.data.len(),
                "Rejecting snapshot with bad checksum"
            );
            outputs.push(respond(self, 0, false, false));
            return Ok(outputs);
        }

        outputs.extend(self.install_snapshot(snapshot, &req.leader_id)?);
        outputs.push(respond(self, chunk_end, true, true));
        Ok(outputs)
    }

    /// Replaces the log up to the snapshot point with `snapshot`.
    fn install_snapshot(
        &mut self,
        snapshot: Snapshot,
        leader: &ServerId,
    ) -> StorageResult<Vec<RaftOutput>> {
        let index = snapshot.last_included_index();
        let term = snapshot.last_included_term();
        self.storage.save_snapshot(&snapshot)?;
        if self.log.term_at(index) == Some(term) {
            // Our log already contains the snapshot point; keep what follows.
            self.log.compact_to(index, term);
        } else {
            self.storage.truncate_after(index)?;
            self.log = RaftLog::with_snapshot(index, term);
        }
        self.snapshot = Some(snapshot.clone());
        self.reload_configuration();
        self.commit_index = index;
        self.last_applied = index;

        info!(
            node_id = %self.config.id,
            index = index.get(),
            term = term.get(),
            bytes = snapshot.data.len(),
            leader = %leader,
            "Installed snapshot from leader"
        );
        Ok(vec![RaftOutput::RestoreSnapshot(snapshot)])
    }

    // -------------------------------------------------------------------------
    // Replication (leader side)
    // -------------------------------------------------------------------------

    fn handle_append_entries_response(&mut self, resp: &AppendEntriesResponse) -> Vec<RaftOutput> {
        if self.state != RaftState::Leader || resp.term != self.current_term {
            return Vec::new();
        }
        self.recent_active.insert(resp.from.clone());

        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&resp.from) else {
            return Vec::new();
        };

        if resp.success {
            if resp.match_index > progress.match_index {
                progress.match_index = resp.match_index;
            }
            progress.next_index = progress.next_index.max(progress.match_index.next());
            let lagging = progress.next_index <= last_index;

            let mut outputs = self.maybe_commit();
            if lagging && self.state == RaftState::Leader {
                outputs.extend(self.send_append(&resp.from));
            }
            outputs
        } else {
            // Fast backoff: jump straight past the follower's hint.
            progress.next_index = progress
                .next_index
                .prev()
                .min(resp.match_index.next())
                .max(LogIndex::new(1));
            self.send_append(&resp.from).into_iter().collect()
        }
    }

    fn handle_install_snapshot_response(
        &mut self,
        resp: &InstallSnapshotResponse,
    ) -> Vec<RaftOutput> {
        if self.state != RaftState::Leader || resp.term != self.current_term {
            return Vec::new();
        }
        self.recent_active.insert(resp.from.clone());

        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&resp.from) else {
            return Vec::new();
        };

        if !resp.done {
            let Some(transfer) = progress
                .snapshot
                .as_mut()
                .filter(|t| t.index == resp.last_included_index)
            else {
                return Vec::new();
            };
            if !resp.success {
                // Resume where the follower is; the next heartbeat resends.
                transfer.offset = resp.next_offset;
                return Vec::new();
            }
            if resp.next_offset <= transfer.offset {
                // Acknowledges a chunk sent again by a heartbeat.
                return Vec::new();
            }
            transfer.offset = resp.next_offset;
            return self.send_append(&resp.from).into_iter().collect();
        }

        progress.snapshot = None;
        if resp.last_included_index > progress.match_index {
            progress.match_index = resp.last_included_index;
        }
        progress.next_index = progress.next_index.max(progress.match_index.next());
        let lagging = progress.next_index <= last_index;

        let mut outputs = self.maybe_commit();
        if lagging && self.state == RaftState::Leader {
            outputs.extend(self.send_append(&resp.from));
        }
        outputs
    }

    fn broadcast_append(&mut self) -> Vec<RaftOutput> {
        let peers: Vec<ServerId> = self.progress.keys().cloned().collect();
        peers
            .iter()
            .filter_map(|peer| self.send_append(peer))
            .collect()
    }

    /// Builds the next replication message for `peer`.
    ///
    /// `next_index` advances optimistically past the entries sent; a
    /// rejection rewinds it. A follower behind the snapshot gets the chunk
    /// at its transfer offset instead.
    fn send_append(&mut self, peer: &ServerId) -> Option<RaftOutput> {
        let progress = self.progress.get_mut(peer)?;

        if progress.next_index <= self.log.snapshot_index() {
            let Some(snapshot) = &self.snapshot else {
                warn!(peer = %peer, "Follower needs compacted entries but no snapshot exists");
                return None;
            };
            let index = snapshot.last_included_index();
            let total = snapshot.data.len() as u64;
            let transfer = progress
                .snapshot
                .filter(|t| t.index == index && t.offset <= total)
                .unwrap_or(SnapshotTransfer { index, offset: 0 });
            progress.snapshot = Some(transfer);

            let end = transfer
                .offset
                .saturating_add(u64::from(self.config.snapshot_chunk_bytes))
                .min(total);
            // Safe cast: offsets are bounded by the snapshot length.
            #[allow(clippy::cast_possible_truncation)]
            let data = snapshot
                .data
                .slice(transfer.offset as usize..end as usize);
            debug!(
                node_id = %self.config.id,
                peer = %peer,
                index = index.get(),
                offset = transfer.offset,
                bytes = data.len(),
                total,
                "Sending snapshot chunk"
            );
            return Some(RaftOutput::SendMessage(Message::InstallSnapshot(
                InstallSnapshotRequest {
                    term: self.current_term,
                    leader_id: self.config.id.clone(),
                    to: peer.clone(),
                    meta: snapshot.meta.clone(),
                    checksum: snapshot.checksum,
                    offset: transfer.offset,
                    data,
                    done: end == total,
                },
            )));
        }

        let next_index = progress.next_index;
        let prev_log_index = next_index.prev();
        let prev_log_term = self.log.term_at(prev_log_index)?;
        let entries = self.log.entries_from(
            next_index,
            self.config.max_entries_per_append as usize,
            self.config.max_append_bytes as usize,
        );
        if let Some(last) = entries.last() {
            progress.next_index = last.index.next();
        }

        Some(RaftOutput::SendMessage(Message::AppendEntries(
            AppendEntriesRequest {
                term: self.current_term,
                leader_id: self.config.id.clone(),
                to: peer.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            },
        )))
    }

    /// Advances the commit index to the highest entry of the current term
    /// stored on a majority of the voters of its configuration.
    fn maybe_commit(&mut self) -> Vec<RaftOutput> {
        if self.state != RaftState::Leader {
            return Vec::new();
        }

        let mut candidate = self.log.last_index();
        while candidate > self.commit_index {
            // Terms never decrease along the log.
            if self.log.term_at(candidate) != Some(self.current_term) {
                break;
            }
            let replicated = {
                let (config, _) = self.configuration_entry_at(candidate);
                config.has_quorum(|id| self.match_of(id) >= candidate)
            };
            if replicated {
                return self.advance_commit(candidate);
            }
            candidate = candidate.prev();
        }
        Vec::new()
    }

    fn match_of(&self, id: &ServerId) -> LogIndex {
        if id == &self.config.id {
            return self.log.last_index();
        }
        self.progress
            .get(id)
            .map_or(LogIndex::new(0), |p| p.match_index)
    }

    fn advance_commit(&mut self, new_commit: LogIndex) -> Vec<RaftOutput> {
        debug_assert!(new_commit <= self.log.last_index());

        let mut outputs = Vec::new();
        if new_commit <= self.commit_index {
            return outputs;
        }
        self.commit_index = new_commit;

        while self.last_applied < self.commit_index {
            let index = self.last_applied.next();
            if let Some(entry) = self.log.get(index) {
                outputs.push(RaftOutput::CommitEntry(entry.clone()));
            }
            self.last_applied = index;
        }

        // Postcondition: everything committed has been handed out.
        debug_assert!(self.last_applied == self.commit_index);

        if self.state == RaftState::Leader
            && self.commit_index >= self.configuration_index
            && !self.configuration.is_voter(&self.config.id)
        {
            info!(
                node_id = %self.config.id,
                index = self.configuration_index.get(),
                "Committed configuration without this server as voter"
            );
            outputs.extend(self.become_follower(None));
        }
        outputs
    }

    // -------------------------------------------------------------------------
    // Log and configuration bookkeeping
    // -------------------------------------------------------------------------

    fn append_local(&mut self, entries: Vec<LogEntry>) -> StorageResult<()> {
        self.storage.append_entries(&entries)?;
        let mut saw_configuration = false;
        for entry in entries {
            saw_configuration |= entry.kind == EntryKind::Configuration;
            self.log.append(entry);
        }
        if saw_configuration {
            self.reload_configuration();
        }
        Ok(())
    }

    /// Recomputes the latest and previous configurations from the log and
    /// snapshot.
    fn reload_configuration(&mut self) {
        let (base, base_index) = self.snapshot.as_ref().map_or_else(
            || (Configuration::empty(), LogIndex::new(0)),
            |s| (s.meta.configuration.clone(), s.meta.configuration_index),
        );

        let mut found: Vec<(Configuration, LogIndex)> = Vec::with_capacity(2);
        for entry in self.log.entries().iter().rev() {
            if entry.kind != EntryKind::Configuration {
                continue;
            }
            match entry.decode_configuration() {
                Some(config) => found.push((config, entry.index)),
                None => warn!(index = entry.index.get(), "Skipping malformed configuration entry"),
            }
            if found.len() == 2 {
                break;
            }
        }

        let mut found = found.into_iter();
        let (latest, latest_index) = found.next().unwrap_or((base.clone(), base_index));
        let (previous, previous_index) = found.next().unwrap_or((base, base_index));

        self.configuration = latest;
        self.configuration_index = latest_index;
        self.previous_configuration = previous;
        self.previous_configuration_index = previous_index;

        if self.state == RaftState::Leader {
            self.sync_progress();
        }
    }

    /// Returns the configuration in effect at `index` and the index of the
    /// entry that carried it.
    fn configuration_entry_at(&self, index: LogIndex) -> (Cow<'_, Configuration>, LogIndex) {
        if index >= self.configuration_index {
            return (Cow::Borrowed(&self.configuration), self.configuration_index);
        }
        if index >= self.previous_configuration_index {
            return (
                Cow::Borrowed(&self.previous_configuration),
                self.previous_configuration_index,
            );
        }
        for entry in self.log.entries().iter().rev().filter(|e| e.index <= index) {
            if let Some(config) = entry.decode_configuration() {
                return (Cow::Owned(config), entry.index);
            }
        }
        match &self.snapshot {
            Some(s) => (
                Cow::Borrowed(&s.meta.configuration),
                s.meta.configuration_index,
            ),
            None => (Cow::Owned(Configuration::empty()), LogIndex::new(0)),
        }
    }

    /// Tracks exactly the members of the latest configuration other than us.
    fn sync_progress(&mut self) {
        let next_index = self.log.last_index().next();
        let members: BTreeSet<ServerId> = self
            .configuration
            .servers()
            .iter()
            .map(|s| s.id.clone())
            .filter(|id| id != &self.config.id)
            .collect();

        self.progress.retain(|id, _| members.contains(id));
        for id in members {
            self.progress.entry(id).or_insert(Progress {
                next_index,
                match_index: LogIndex::new(0),
                snapshot: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::ServerDescriptor;
    use crate::storage::MemoryStorage;

    fn id(name: &str) -> ServerId {
        ServerId::new(name).unwrap()
    }

    fn cluster_config(names: &[&str]) -> Configuration {
        Configuration::new(
            names
                .iter()
                .map(|n| ServerDescriptor::voter(id(n), format!("{n}:7000")))
                .collect(),
        )
        .unwrap()
    }

    fn test_config(name: &str) -> RaftConfig {
        RaftConfig::new(id(name))
            .with_election_ticks(5, 10)
            .with_heartbeat_ticks(2)
    }

    fn make_node(name: &str, config: &Configuration) -> RaftNode<MemoryStorage> {
        make_node_with(test_config(name), config)
    }

    fn make_node_with(raft_config: RaftConfig, config: &Configuration) -> RaftNode<MemoryStorage> {
        let mut node = RaftNode::new(raft_config, MemoryStorage::new()).unwrap();
        node.bootstrap(config.clone()).unwrap();
        node
    }

    fn tick_until_campaign(node: &mut RaftNode<MemoryStorage>) -> Vec<RaftOutput> {
        for _ in 0..20 {
            let outputs = node.tick().unwrap();
            if node.state() != RaftState::Follower {
                return outputs;
            }
        }
        panic!("node never campaigned");
    }

    fn messages(outputs: &[RaftOutput]) -> Vec<Message> {
        outputs
            .iter()
            .filter_map(|o| match o {
                RaftOutput::SendMessage(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn committed(outputs: &[RaftOutput]) -> Vec<LogEntry> {
        outputs
            .iter()
            .filter_map(|o| match o {
                RaftOutput::CommitEntry(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    /// Delivers messages between nodes until the network is quiet.
    fn settle(nodes: &mut [RaftNode<MemoryStorage>], mut queue: Vec<Message>) -> Vec<RaftOutput> {
        let mut all = Vec::new();
        while let Some(msg) = queue.pop() {
            let Some(target) = nodes.iter_mut().find(|n| n.id() == msg.to()) else {
                continue;
            };
            let outputs = target.handle_message(msg).unwrap();
            queue.extend(messages(&outputs));
            all.extend(outputs);
        }
        all
    }

    #[test]
    fn test_new_node_is_follower() {
        let node = RaftNode::new(RaftConfig::new(id("a")), MemoryStorage::new()).unwrap();

        assert_eq!(node.state(), RaftState::Follower);
        assert_eq!(node.current_term(), TermId::new(0));
        assert!(node.leader_id().is_none());
        assert!(node.configuration().is_empty());
    }

    #[test]
    fn test_node_outside_configuration_never_campaigns() {
        let mut node = RaftNode::new(
            RaftConfig::new(id("a")).with_election_ticks(3, 3).with_heartbeat_ticks(1),
            MemoryStorage::new(),
        )
        .unwrap();
        for _ in 0..50 {
            assert!(node.tick().unwrap().is_empty());
        }
        assert_eq!(node.state(), RaftState::Follower);
        assert_eq!(node.current_term().get(), 0);
    }

    #[test]
    fn test_bootstrap_rejected_with_existing_state() {
        let config = cluster_config(&["a"]);
        let mut node = make_node("a", &config);
        assert!(matches!(
            node.bootstrap(config),
            Err(RaftError::AlreadyBootstrapped)
        ));
    }

    #[test]
    fn test_single_node_elects_itself_and_commits() {
        let config = cluster_config(&["a"]);
        let mut node = make_node("a", &config);

        let outputs = tick_until_campaign(&mut node);
        assert!(node.is_leader());
        assert!(outputs.iter().any(|o| matches!(o, RaftOutput::BecameLeader)));

        // Bootstrap config (index 1) and noop (index 2) commit together.
        let entries = committed(&outputs);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::Configuration);
        assert_eq!(entries[1].kind, EntryKind::Noop);

        let (index, outputs) = node.propose(Bytes::from("cmd")).unwrap();
        assert_eq!(index.get(), 3);
        assert_eq!(committed(&outputs)[0].data, Bytes::from("cmd"));
        assert_eq!(node.commit_index().get(), 3);
    }

    #[test]
    fn test_propose_on_follower_returns_hint() {
        let config = cluster_config(&["a", "b", "c"]);
        let mut node = make_node("a", &config);
        let result = node.propose(Bytes::from("x"));
        assert!(matches!(
            result,
            Err(RaftError::NotLeader { leader_hint: None })
        ));
    }

    #[test]
    fn test_three_node_election_and_replication() {
        let config = cluster_config(&["a", "b", "c"]);
        let mut nodes = vec![
            make_node("a", &config),
            make_node("b", &config),
            make_node("c", &config),
        ];

        let outputs = tick_until_campaign(&mut nodes[0]);
        assert_eq!(nodes[0].state(), RaftState::Candidate);
        assert_eq!(messages(&outputs).len(), 2);

        settle(&mut nodes, messages(&outputs));
        assert!(nodes[0].is_leader());
        assert_eq!(nodes[1].leader_id(), Some(&id("a")));
        assert_eq!(nodes[1].leader_address(), Some("a:7000"));

        let (index, outputs) = nodes[0].propose(Bytes::from("hello")).unwrap();
        let all = settle(&mut nodes, messages(&outputs));
        assert!(committed(&all).iter().any(|e| e.index == index));
        assert_eq!(nodes[0].commit_index(), index);

        // Followers learn the commit index on the next heartbeat.
        let mut heartbeat = Vec::new();
        for _ in 0..2 {
            heartbeat.extend(messages(&nodes[0].tick().unwrap()));
        }
        settle(&mut nodes, heartbeat);
        assert_eq!(nodes[1].commit_index(), index);
        assert_eq!(nodes[2].commit_index(), index);
    }

    #[test]
    fn test_vote_not_granted_twice_in_same_term() {
        let config = cluster_config(&["a", "b", "c"]);
        let mut node = make_node("a", &config);

        let request = |candidate: &str| {
            Message::RequestVote(RequestVoteRequest {
                term: TermId::new(2),
                candidate_id: id(candidate),
                to: id("a"),
                last_log_index: LogIndex::new(1),
                last_log_term: TermId::new(1),
            })
        };

        let granted = |outputs: Vec<RaftOutput>| match messages(&outputs).pop() {
            Some(Message::RequestVoteResponse(r)) => r.vote_granted,
            _ => panic!("expected vote response"),
        };

        assert!(granted(node.handle_message(request("b")).unwrap()));
        assert!(!granted(node.handle_message(request("c")).unwrap()));
        assert_eq!(node.voted_for(), Some(&id("b")));

        // The vote survives a restart.
        let restarted = RaftNode::new(RaftConfig::new(id("a")), node.into_storage()).unwrap();
        assert_eq!(restarted.voted_for(), Some(&id("b")));
        assert_eq!(restarted.current_term().get(), 2);
    }

    #[test]
    fn test_vote_rejected_for_stale_log() {
        let config = cluster_config(&["a", "b"]);
        let mut node = make_node("a", &config);

        let outputs = node
            .handle_message(Message::RequestVote(RequestVoteRequest {
                term: TermId::new(5),
                candidate_id: id("b"),
                to: id("a"),
                last_log_index: LogIndex::new(0),
                last_log_term: TermId::new(0),
            }))
            .unwrap();
        match messages(&outputs).pop() {
            Some(Message::RequestVoteResponse(r)) => assert!(!r.vote_granted),
            _ => panic!("expected vote response"),
        }
        // The term is still adopted.
        assert_eq!(node.current_term().get(), 5);
    }

    #[test]
    fn test_message_for_other_server_is_dropped() {
        let config = cluster_config(&["a", "b"]);
        let mut node = make_node("a", &config);
        let outputs = node
            .handle_message(Message::RequestVote(RequestVoteRequest {
                term: TermId::new(9),
                candidate_id: id("b"),
                to: id("z"),
                last_log_index: LogIndex::new(5),
                last_log_term: TermId::new(5),
            }))
            .unwrap();
        assert!(outputs.is_empty());
        assert_eq!(node.current_term().get(), 1);
    }

    #[test]
    fn test_follower_truncates_conflicting_suffix() {
        let config = cluster_config(&["a", "b"]);
        let mut node = make_node("b", &config);

        // Entries 2..=3 from a leader of term 2.
        let append = |term: u64, prev: u64, prev_term: u64, entries: Vec<LogEntry>| {
            Message::AppendEntries(AppendEntriesRequest {
                term: TermId::new(term),
                leader_id: id("a"),
                to: id("b"),
                prev_log_index: LogIndex::new(prev),
                prev_log_term: TermId::new(prev_term),
                entries,
                leader_commit: LogIndex::new(1),
            })
        };
        let entry = |term: u64, index: u64| {
            LogEntry::new(TermId::new(term), LogIndex::new(index), Bytes::from("x"))
        };

        node.handle_message(append(2, 1, 1, vec![entry(2, 2), entry(2, 3)]))
            .unwrap();
        assert_eq!(node.log().last_index().get(), 3);

        // A new leader in term 3 overwrites index 3.
        let outputs = node
            .handle_message(append(3, 2, 2, vec![entry(3, 3)]))
            .unwrap();
        assert_eq!(node.log().last_index().get(), 3);
        assert_eq!(node.log().term_at(LogIndex::new(3)), Some(TermId::new(3)));
        match messages(&outputs).pop() {
            Some(Message::AppendEntriesResponse(r)) => {
                assert!(r.success);
                assert_eq!(r.match_index.get(), 3);
            }
            _ => panic!("expected append response"),
        }

        // A mismatch far ahead returns our last index as the hint.
        let outputs = node.handle_message(append(3, 10, 3, Vec::new())).unwrap();
        match messages(&outputs).pop() {
            Some(Message::AppendEntriesResponse(r)) => {
                assert!(!r.success);
                assert_eq!(r.match_index.get(), 3);
            }
            _ => panic!("expected append response"),
        }
    }

    #[test]
    fn test_configuration_change_requires_commit_of_current_term() {
        let config = cluster_config(&["a", "b", "c"]);
        let mut nodes = vec![
            make_node("a", &config),
            make_node("b", &config),
            make_node("c", &config),
        ];
        let outputs = tick_until_campaign(&mut nodes[0]);

        // Deliver only the vote responses, not the noop replication.
        let mut queue = messages(&outputs);
        let mut pending_appends = Vec::new();
        while let Some(msg) = queue.pop() {
            let target = nodes.iter_mut().find(|n| n.id() == msg.to()).unwrap();
            for m in messages(&target.handle_message(msg).unwrap()) {
                if matches!(m, Message::AppendEntries(_)) {
                    pending_appends.push(m);
                } else {
                    queue.push(m);
                }
            }
        }
        assert!(nodes[0].is_leader());

        let change = ConfigChange::AddNonVoter {
            id: id("d"),
            address: "d:7000".to_string(),
        };
        assert!(matches!(
            nodes[0].change_configuration(&change, LogIndex::new(0)),
            Err(RaftError::ConfigurationConflict { .. })
        ));

        settle(&mut nodes, pending_appends);
        let (index, outputs) = nodes[0]
            .change_configuration(&change, LogIndex::new(1))
            .unwrap();
        assert_eq!(nodes[0].configuration_index(), index);

        // A second change while the first is in flight conflicts.
        let second = ConfigChange::RemoveServer { id: id("d") };
        assert!(matches!(
            nodes[0].change_configuration(&second, LogIndex::new(0)),
            Err(RaftError::ConfigurationConflict { .. })
        ));

        settle(&mut nodes, messages(&outputs));
        assert!(nodes[0].commit_index() >= index);

        // A stale expected index conflicts.
        assert!(matches!(
            nodes[0].change_configuration(&second, LogIndex::new(1)),
            Err(RaftError::ConfigurationConflict { .. })
        ));
        assert!(nodes[0]
            .change_configuration(&second, index)
            .is_ok());
    }

    #[test]
    fn test_leader_steps_down_after_removing_itself() {
        let config = cluster_config(&["a", "b", "c"]);
        let mut nodes = vec![
            make_node("a", &config),
            make_node("b", &config),
            make_node("c", &config),
        ];
        let outputs = tick_until_campaign(&mut nodes[0]);
        settle(&mut nodes, messages(&outputs));
        assert!(nodes[0].is_leader());

        let (_, outputs) = nodes[0]
            .change_configuration(&ConfigChange::RemoveServer { id: id("a") }, LogIndex::new(0))
            .unwrap();
        let all = settle(&mut nodes, messages(&outputs));

        assert!(all.iter().any(|o| matches!(o, RaftOutput::SteppedDown)));
        assert_eq!(nodes[0].state(), RaftState::Follower);
        assert!(!nodes[0].configuration().contains(&id("a")));
    }

    #[test]
    fn test_snapshot_compacts_and_restarts() {
        let config = cluster_config(&["a"]);
        let mut node = make_node("a", &config);
        tick_until_campaign(&mut node);
        for i in 0..5 {
            node.propose(Bytes::from(format!("cmd-{i}"))).unwrap();
        }
        assert_eq!(node.last_applied().get(), 7);

        node.take_snapshot(Bytes::from("image")).unwrap();
        assert_eq!(node.log().snapshot_index().get(), 7);
        assert!(node.log().is_empty());

        let restarted = RaftNode::new(
            RaftConfig::new(id("a")),
            node.into_storage(),
        )
        .unwrap();
        assert_eq!(restarted.last_applied().get(), 7);
        assert_eq!(restarted.configuration(), &config);
        assert_eq!(restarted.snapshot().unwrap().data, Bytes::from("image"));
    }

    #[test]
    fn test_lagging_follower_receives_snapshot() {
        let config = cluster_config(&["a", "b", "c"]);
        let mut nodes = vec![
            make_node("a", &config),
            make_node("b", &config),
            make_node("c", &config),
        ];
        let outputs = tick_until_campaign(&mut nodes[0]);
        settle(&mut nodes, messages(&outputs));
        assert!(nodes[0].is_leader());

        // Commit a few commands through b while c is cut off.
        for i in 0..3 {
            let (_, outputs) = nodes[0].propose(Bytes::from(format!("c{i}"))).unwrap();
            let reachable = messages(&outputs)
                .into_iter()
                .filter(|m| m.to() != &id("c"))
                .collect();
            settle(&mut nodes, reachable);
        }
        assert_eq!(nodes[0].commit_index().get(), 5);
        assert!(nodes[2].log().last_index().get() < 5);

        nodes[0].take_snapshot(Bytes::from("image")).unwrap();

        // Heal: c is too far behind and gets the snapshot.
        let mut heartbeat = Vec::new();
        for _ in 0..2 {
            heartbeat.extend(messages(&nodes[0].tick().unwrap()));
        }
        let all = settle(&mut nodes, heartbeat);

        assert!(all
            .iter()
            .any(|o| matches!(o, RaftOutput::RestoreSnapshot(s) if s.data == Bytes::from("image"))));
        assert_eq!(nodes[2].commit_index().get(), 5);
        assert_eq!(nodes[2].log().snapshot_index().get(), 5);
        assert_eq!(nodes[2].configuration(), &config);
    }

    #[test]
    fn test_snapshot_streams_in_chunks() {
        let config = cluster_config(&["a", "b", "c"]);
        let mut nodes = vec![
            make_node_with(test_config("a").with_snapshot_chunk_bytes(1000), &config),
            make_node("b", &config),
            make_node("c", &config),
        ];
        let outputs = tick_until_campaign(&mut nodes[0]);
        settle(&mut nodes, messages(&outputs));
        assert!(nodes[0].is_leader());

        for i in 0..3 {
            let (_, outputs) = nodes[0].propose(Bytes::from(format!("c{i}"))).unwrap();
            let reachable = messages(&outputs)
                .into_iter()
                .filter(|m| m.to() != &id("c"))
                .collect();
            settle(&mut nodes, reachable);
        }
        let image: Bytes = (0..4500_u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
        nodes[0].take_snapshot(image.clone()).unwrap();

        // Deliver one heartbeat round and record every chunk sent to c.
        let mut queue = Vec::new();
        for _ in 0..2 {
            queue.extend(messages(&nodes[0].tick().unwrap()));
        }
        let mut chunks = Vec::new();
        let mut restored = Vec::new();
        while let Some(msg) = queue.pop() {
            if let Message::InstallSnapshot(req) = &msg {
                chunks.push((req.offset, req.data.len(), req.done));
            }
            let target = nodes.iter_mut().find(|n| n.id() == msg.to()).unwrap();
            let outputs = target.handle_message(msg).unwrap();
            queue.extend(messages(&outputs));
            restored.extend(outputs.into_iter().filter_map(|o| match o {
                RaftOutput::RestoreSnapshot(s) => Some(s),
                _ => None,
            }));
        }

        assert!(chunks.iter().all(|&(_, len, _)| len <= 1000));
        let mut offsets: Vec<u64> = chunks.iter().map(|&(offset, _, _)| offset).collect();
        offsets.dedup();
        assert_eq!(offsets, vec![0, 1000, 2000, 3000, 4000]);
        assert!(chunks.last().unwrap().2);

        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].data, image);
        assert!(restored[0].verify_checksum());
        assert_eq!(nodes[2].commit_index().get(), 5);
        assert_eq!(nodes[2].snapshot().unwrap().data, image);
    }

    #[test]
    fn test_snapshot_chunk_without_start_is_rejected() {
        fn response(outputs: &[RaftOutput]) -> InstallSnapshotResponse {
            match messages(outputs).pop() {
                Some(Message::InstallSnapshotResponse(resp)) => resp,
                other => panic!("expected snapshot response, got {other:?}"),
            }
        }

        let config = cluster_config(&["a", "b"]);
        let mut node = make_node("b", &config);
        let meta = SnapshotMeta {
            last_included_index: LogIndex::new(9),
            last_included_term: TermId::new(1),
            configuration: config,
            configuration_index: LogIndex::new(1),
        };
        let chunk = |offset: u64, data: &'static [u8], done: bool| {
            Message::InstallSnapshot(InstallSnapshotRequest {
                term: TermId::new(1),
                leader_id: id("a"),
                to: id("b"),
                meta: meta.clone(),
                checksum: crc32fast::hash(b"abcdef"),
                offset,
                data: Bytes::from_static(data),
                done,
            })
        };

        let resp = response(&node.handle_message(chunk(3, b"def", true)).unwrap());
        assert!(!resp.success);
        assert_eq!(resp.next_offset, 0);

        let resp = response(&node.handle_message(chunk(0, b"abc", false)).unwrap());
        assert!(resp.success && !resp.done);
        assert_eq!(resp.next_offset, 3);

        // A repeated chunk is acknowledged without changing the position.
        let resp = response(&node.handle_message(chunk(0, b"abc", false)).unwrap());
        assert!(resp.success);
        assert_eq!(resp.next_offset, 3);

        let outputs = node.handle_message(chunk(3, b"def", true)).unwrap();
        assert!(response(&outputs).done);
        assert_eq!(node.commit_index().get(), 9);
        assert_eq!(node.snapshot().unwrap().data, Bytes::from_static(b"abcdef"));
    }

    #[test]
    fn test_catch_up_batches_fit_byte_budget() {
        const BUDGET: u32 = 10_000;
        let config = cluster_config(&["a", "b", "c"]);
        let mut nodes = vec![
            make_node_with(test_config("a").with_max_append_bytes(BUDGET), &config),
            make_node("b", &config),
            make_node("c", &config),
        ];
        let outputs = tick_until_campaign(&mut nodes[0]);
        settle(&mut nodes, messages(&outputs));
        assert!(nodes[0].is_leader());

        // c misses twenty 4 KB commands.
        let mut last = LogIndex::new(0);
        for i in 0..20_u8 {
            let (index, outputs) = nodes[0].propose(Bytes::from(vec![i; 4000])).unwrap();
            last = index;
            let reachable = messages(&outputs)
                .into_iter()
                .filter(|m| m.to() != &id("c"))
                .collect();
            settle(&mut nodes, reachable);
        }
        assert_eq!(nodes[0].commit_index(), last);

        let mut queue = Vec::new();
        for _ in 0..2 {
            queue.extend(messages(&nodes[0].tick().unwrap()));
        }
        let mut batches = 0;
        while let Some(msg) = queue.pop() {
            if let Message::AppendEntries(req) = &msg {
                let bytes: usize = req.entries.iter().map(LogEntry::encoded_len).sum();
                assert!(bytes <= BUDGET as usize, "batch of {bytes} bytes");
                if req.to == id("c") && !req.entries.is_empty() {
                    batches += 1;
                }
            }
            let target = nodes.iter_mut().find(|n| n.id() == msg.to()).unwrap();
            queue.extend(messages(&target.handle_message(msg).unwrap()));
        }

        assert!(batches >= 10);
        assert_eq!(nodes[2].log().last_index(), last);
        assert_eq!(nodes[2].commit_index(), last);
    }

    #[test]
    fn test_leader_without_quorum_steps_down() {
        let config = cluster_config(&["a", "b", "c"]);
        let mut nodes = vec![
            make_node("a", &config),
            make_node("b", &config),
            make_node("c", &config),
        ];
        let outputs = tick_until_campaign(&mut nodes[0]);
        settle(&mut nodes, messages(&outputs));
        assert!(nodes[0].is_leader());

        // Isolate the leader: tick without delivering anything.
        let mut stepped_down = false;
        for _ in 0..30 {
            let outputs = nodes[0].tick().unwrap();
            if outputs.iter().any(|o| matches!(o, RaftOutput::SteppedDown)) {
                stepped_down = true;
                break;
            }
        }
        assert!(stepped_down);
        assert_eq!(nodes[0].state(), RaftState::Follower);
    }

    #[test]
    fn test_storage_failure_is_returned() {
        let config = cluster_config(&["a", "b"]);
        let mut node = make_node("a", &config);
        let mut storage = node.into_storage();
        storage.set_fail_writes(true);
        node = RaftNode::new(
            RaftConfig::new(id("a")).with_election_ticks(3, 3),
            storage,
        )
        .unwrap();

        let mut result = Ok(Vec::new());
        for _ in 0..3 {
            result = node.tick();
        }
        assert!(matches!(result, Err(StorageError::Io { .. })));
    }
}
