//! Raft RPC message types.
//!
//! Every message names its sender and its intended receiver. A node drops
//! messages addressed to someone else, which matters when an address is
//! reused by a different server after a membership change.

use raftcache_core::{LogIndex, ServerId, TermId};

use bytes::Bytes;

use crate::log::LogEntry;
use crate::snapshot::SnapshotMeta;

/// Raft message types for communication between servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Request vote from candidate to other voters.
    RequestVote(RequestVoteRequest),
    /// Response to vote request.
    RequestVoteResponse(RequestVoteResponse),
    /// Append entries from leader to followers (also used as heartbeat).
    AppendEntries(AppendEntriesRequest),
    /// Response to append entries.
    AppendEntriesResponse(AppendEntriesResponse),
    /// Full snapshot sent to a follower whose next entry was compacted away.
    InstallSnapshot(InstallSnapshotRequest),
    /// Response to install snapshot.
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl Message {
    /// Returns the message type name, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RequestVote(_) => "RequestVote",
            Self::RequestVoteResponse(_) => "RequestVoteResponse",
            Self::AppendEntries(_) => "AppendEntries",
            Self::AppendEntriesResponse(_) => "AppendEntriesResponse",
            Self::InstallSnapshot(_) => "InstallSnapshot",
            Self::InstallSnapshotResponse(_) => "InstallSnapshotResponse",
        }
    }

    /// Returns the sender of this message.
    #[must_use]
    pub const fn from(&self) -> &ServerId {
        match self {
            Self::RequestVote(r) => &r.candidate_id,
            Self::RequestVoteResponse(r) => &r.from,
            Self::AppendEntries(r) => &r.leader_id,
            Self::AppendEntriesResponse(r) => &r.from,
            Self::InstallSnapshot(r) => &r.leader_id,
            Self::InstallSnapshotResponse(r) => &r.from,
        }
    }

    /// Returns the receiver of this message.
    #[must_use]
    pub const fn to(&self) -> &ServerId {
        match self {
            Self::RequestVote(r) => &r.to,
            Self::RequestVoteResponse(r) => &r.to,
            Self::AppendEntries(r) => &r.to,
            Self::AppendEntriesResponse(r) => &r.to,
            Self::InstallSnapshot(r) => &r.to,
            Self::InstallSnapshotResponse(r) => &r.to,
        }
    }

    /// Returns the term of this message.
    #[must_use]
    pub const fn term(&self) -> TermId {
        match self {
            Self::RequestVote(r) => r.term,
            Self::RequestVoteResponse(r) => r.term,
            Self::AppendEntries(r) => r.term,
            Self::AppendEntriesResponse(r) => r.term,
            Self::InstallSnapshot(r) => r.term,
            Self::InstallSnapshotResponse(r) => r.term,
        }
    }
}

/// `RequestVote` RPC request.
///
/// Sent by candidates to gather votes during leader election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: TermId,
    /// Candidate requesting vote.
    pub candidate_id: ServerId,
    /// Target voter.
    pub to: ServerId,
    /// Index of candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry.
    pub last_log_term: TermId,
}

/// `RequestVote` RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteResponse {
    /// Current term, for candidate to update itself.
    pub term: TermId,
    /// Sender of this response.
    pub from: ServerId,
    /// Candidate that requested the vote.
    pub to: ServerId,
    /// True if vote was granted.
    pub vote_granted: bool,
}

/// `AppendEntries` RPC request.
///
/// Sent by leader to replicate log entries and as heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: TermId,
    /// Leader sending this request.
    pub leader_id: ServerId,
    /// Target follower.
    pub to: ServerId,
    /// Index of log entry immediately preceding new ones.
    pub prev_log_index: LogIndex,
    /// Term of `prev_log_index` entry.
    pub prev_log_term: TermId,
    /// Log entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Returns true if this is a heartbeat (no entries).
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `AppendEntries` RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    /// Current term, for leader to update itself.
    pub term: TermId,
    /// Sender of this response.
    pub from: ServerId,
    /// Leader that sent the request.
    pub to: ServerId,
    /// True if follower contained entry matching `prev_log_index`/term.
    pub success: bool,
    /// On success, the last index known to match the leader. On failure, a
    /// hint: the highest index the follower might still share with the
    /// leader.
    pub match_index: LogIndex,
}

/// `InstallSnapshot` RPC request.
///
/// A snapshot is sent as a sequence of chunks, one per request, starting at
/// offset 0. The leader sends the next chunk only after the follower
/// acknowledges the previous one; a repeated heartbeat resends the current
/// chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: TermId,
    /// Leader sending the snapshot.
    pub leader_id: ServerId,
    /// Target follower.
    pub to: ServerId,
    /// What the snapshot covers.
    pub meta: SnapshotMeta,
    /// CRC32 checksum of the whole snapshot image.
    pub checksum: u32,
    /// Byte offset of `data` within the image.
    pub offset: u64,
    /// This chunk of the image.
    pub data: Bytes,
    /// True if this is the last chunk.
    pub done: bool,
}

impl InstallSnapshotRequest {
    /// Returns the last log index covered by the snapshot.
    #[must_use]
    pub const fn last_included_index(&self) -> LogIndex {
        self.meta.last_included_index
    }
}

/// `InstallSnapshot` RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotResponse {
    /// Current term, for leader to update itself.
    pub term: TermId,
    /// Sender of this response.
    pub from: ServerId,
    /// Leader that sent the snapshot.
    pub to: ServerId,
    /// Last index covered by the snapshot being sent.
    pub last_included_index: LogIndex,
    /// Bytes of the image the follower holds; the next chunk starts here.
    pub next_offset: u64,
    /// True once the snapshot is installed or already covered by the
    /// follower's log.
    pub done: bool,
    /// False if the chunk was rejected.
    pub success: bool,
}
