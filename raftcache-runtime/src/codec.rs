//! Frame codec for the node-to-node TCP protocol.
//!
//! Raft messages and request/response RPCs share one connection format.
//!
//! # Wire Format
//!
//! Each frame is:
//! - 4 bytes: frame length (u32 little-endian, not including this header)
//! - 1 byte: frame kind
//! - N bytes: kind-specific body
//!
//! # Frame Kinds
//!
//! - 1: Raft message: sender address (u16 length-prefixed UTF-8), message tag
//!   (u8), then fixed-width little-endian fields and length-prefixed
//!   strings/bytes
//! - 2: RPC request: `request_id` (u64), opaque body
//! - 3: RPC response: `request_id` (u64), opaque body
//!
//! RPC bodies are opaque here; the cache server defines their encoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use raftcache_core::{LogIndex, ServerId, TermId, MAX_FRAME_BYTES};
use raftcache_raft::{
    AppendEntriesRequest, AppendEntriesResponse, Configuration, EntryKind, InstallSnapshotRequest,
    InstallSnapshotResponse, LogEntry, Message, RequestVoteRequest, RequestVoteResponse,
    SnapshotMeta, ENTRY_HEADER_BYTES,
};
use thiserror::Error;

/// Frame header size: length prefix plus kind byte.
const FRAME_HEADER_BYTES: usize = 5;

/// Frame kinds.
const FRAME_RAFT: u8 = 1;
const FRAME_REQUEST: u8 = 2;
const FRAME_RESPONSE: u8 = 3;

/// Raft message tags.
const TAG_REQUEST_VOTE: u8 = 1;
const TAG_REQUEST_VOTE_RESPONSE: u8 = 2;
const TAG_APPEND_ENTRIES: u8 = 3;
const TAG_APPEND_ENTRIES_RESPONSE: u8 = 4;
const TAG_INSTALL_SNAPSHOT: u8 = 5;
const TAG_INSTALL_SNAPSHOT_RESPONSE: u8 = 6;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual size.
        size: u64,
        /// Maximum allowed.
        max: u32,
    },

    /// Unknown frame kind.
    #[error("unknown frame kind: {kind}")]
    UnknownFrameKind {
        /// The unknown kind value.
        kind: u8,
    },

    /// Unknown Raft message tag.
    #[error("unknown message type: {tag}")]
    UnknownMessageType {
        /// The unknown tag value.
        tag: u8,
    },

    /// Insufficient data to decode.
    #[error("insufficient data: need {need} bytes, have {have}")]
    InsufficientData {
        /// Bytes needed.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// A field held an invalid value.
    #[error("malformed frame: {reason}")]
    Malformed {
        /// What was wrong.
        reason: &'static str,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A one-way Raft message.
    Raft {
        /// Address the sender can be reached at.
        from_address: String,
        /// The message.
        message: Message,
    },
    /// An RPC request expecting a `Response` with the same id.
    Request {
        /// Caller-chosen id, unique per connection.
        request_id: u64,
        /// Opaque request body.
        body: Bytes,
    },
    /// The answer to a `Request`.
    Response {
        /// Id of the request being answered.
        request_id: u64,
        /// Opaque response body.
        body: Bytes,
    },
}

/// Encodes a frame, including its length prefix.
///
/// # Errors
/// Returns `FrameTooLarge` if the frame exceeds `MAX_FRAME_BYTES`.
pub fn encode_frame(frame: &Frame) -> CodecResult<Bytes> {
    let mut buf = BytesMut::with_capacity(256);

    // Reserve space for length prefix (filled in at the end).
    buf.put_u32_le(0);

    match frame {
        Frame::Raft {
            from_address,
            message,
        } => {
            buf.put_u8(FRAME_RAFT);
            put_str(&mut buf, from_address);
            encode_message(&mut buf, message);
        }
        Frame::Request { request_id, body } => {
            buf.put_u8(FRAME_REQUEST);
            buf.put_u64_le(*request_id);
            buf.put_slice(body);
        }
        Frame::Response { request_id, body } => {
            buf.put_u8(FRAME_RESPONSE);
            buf.put_u64_le(*request_id);
            buf.put_slice(body);
        }
    }

    let len = (buf.len() - 4) as u64;
    if len > u64::from(MAX_FRAME_BYTES) {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_BYTES,
        });
    }

    // Safe cast: len was checked against MAX_FRAME_BYTES which fits in u32.
    #[allow(clippy::cast_possible_truncation)]
    let len = len as u32;
    buf[0..4].copy_from_slice(&len.to_le_bytes());

    Ok(buf.freeze())
}

/// Decodes one frame from the front of `data`.
///
/// Returns the frame and the number of bytes consumed. Returns
/// `InsufficientData` when `data` holds only part of a frame, which stream
/// readers treat as "read more".
///
/// # Errors
/// Returns an error if the data is malformed or incomplete.
pub fn decode_frame(data: &[u8]) -> CodecResult<(Frame, usize)> {
    if data.len() < 4 {
        return Err(CodecError::InsufficientData {
            need: 4,
            have: data.len(),
        });
    }

    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            size: u64::from(len),
            max: MAX_FRAME_BYTES,
        });
    }

    let total_len = 4 + len as usize;
    if data.len() < total_len {
        return Err(CodecError::InsufficientData {
            need: total_len,
            have: data.len(),
        });
    }
    if total_len < FRAME_HEADER_BYTES {
        return Err(CodecError::Malformed {
            reason: "empty frame",
        });
    }

    let kind = data[4];
    let mut body = Bytes::copy_from_slice(&data[FRAME_HEADER_BYTES..total_len]);

    let frame = match kind {
        FRAME_RAFT => {
            let from_address = get_str(&mut body)?;
            let message = decode_message(&mut body)?;
            if body.has_remaining() {
                return Err(CodecError::Malformed {
                    reason: "trailing bytes after message",
                });
            }
            Frame::Raft {
                from_address,
                message,
            }
        }
        FRAME_REQUEST => {
            ensure_remaining(&body, 8)?;
            let request_id = body.get_u64_le();
            Frame::Request { request_id, body }
        }
        FRAME_RESPONSE => {
            ensure_remaining(&body, 8)?;
            let request_id = body.get_u64_le();
            Frame::Response { request_id, body }
        }
        _ => return Err(CodecError::UnknownFrameKind { kind }),
    };

    Ok((frame, total_len))
}

fn encode_message(buf: &mut BytesMut, message: &Message) {
    match message {
        Message::RequestVote(req) => {
            buf.put_u8(TAG_REQUEST_VOTE);
            buf.put_u64_le(req.term.get());
            put_id(buf, &req.candidate_id);
            put_id(buf, &req.to);
            buf.put_u64_le(req.last_log_index.get());
            buf.put_u64_le(req.last_log_term.get());
        }
        Message::RequestVoteResponse(resp) => {
            buf.put_u8(TAG_REQUEST_VOTE_RESPONSE);
            buf.put_u64_le(resp.term.get());
            put_id(buf, &resp.from);
            put_id(buf, &resp.to);
            buf.put_u8(u8::from(resp.vote_granted));
        }
        Message::AppendEntries(req) => {
            buf.put_u8(TAG_APPEND_ENTRIES);
            buf.put_u64_le(req.term.get());
            put_id(buf, &req.leader_id);
            put_id(buf, &req.to);
            buf.put_u64_le(req.prev_log_index.get());
            buf.put_u64_le(req.prev_log_term.get());
            buf.put_u64_le(req.leader_commit.get());

            // Safe cast: entries count is bounded by max_entries_per_append.
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(req.entries.len() as u32);
            for entry in &req.entries {
                encode_log_entry(buf, entry);
            }
        }
        Message::AppendEntriesResponse(resp) => {
            buf.put_u8(TAG_APPEND_ENTRIES_RESPONSE);
            buf.put_u64_le(resp.term.get());
            put_id(buf, &resp.from);
            put_id(buf, &resp.to);
            buf.put_u8(u8::from(resp.success));
            buf.put_u64_le(resp.match_index.get());
        }
        Message::InstallSnapshot(req) => {
            buf.put_u8(TAG_INSTALL_SNAPSHOT);
            buf.put_u64_le(req.term.get());
            put_id(buf, &req.leader_id);
            put_id(buf, &req.to);
            buf.put_u64_le(req.meta.last_included_index.get());
            buf.put_u64_le(req.meta.last_included_term.get());
            buf.put_u64_le(req.meta.configuration_index.get());
            req.meta.configuration.encode_into(buf);
            buf.put_u32_le(req.checksum);
            buf.put_u64_le(req.offset);
            buf.put_u8(u8::from(req.done));
            // Safe cast: chunks are bounded by the snapshot chunk size, far
            // below u32::MAX.
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(req.data.len() as u32);
            buf.put_slice(&req.data);
        }
        Message::InstallSnapshotResponse(resp) => {
            buf.put_u8(TAG_INSTALL_SNAPSHOT_RESPONSE);
            buf.put_u64_le(resp.term.get());
            put_id(buf, &resp.from);
            put_id(buf, &resp.to);
            buf.put_u64_le(resp.last_included_index.get());
            buf.put_u64_le(resp.next_offset);
            buf.put_u8(u8::from(resp.done));
            buf.put_u8(u8::from(resp.success));
        }
    }
}

fn decode_message(buf: &mut Bytes) -> CodecResult<Message> {
    ensure_remaining(buf, 1)?;
    let tag = buf.get_u8();

    let message = match tag {
        TAG_REQUEST_VOTE => {
            let term = get_term(buf)?;
            let candidate_id = get_id(buf)?;
            let to = get_id(buf)?;
            ensure_remaining(buf, 16)?;
            Message::RequestVote(RequestVoteRequest {
                term,
                candidate_id,
                to,
                last_log_index: LogIndex::new(buf.get_u64_le()),
                last_log_term: TermId::new(buf.get_u64_le()),
            })
        }
        TAG_REQUEST_VOTE_RESPONSE => {
            let term = get_term(buf)?;
            let from = get_id(buf)?;
            let to = get_id(buf)?;
            ensure_remaining(buf, 1)?;
            Message::RequestVoteResponse(RequestVoteResponse {
                term,
                from,
                to,
                vote_granted: buf.get_u8() != 0,
            })
        }
        TAG_APPEND_ENTRIES => {
            let term = get_term(buf)?;
            let leader_id = get_id(buf)?;
            let to = get_id(buf)?;
            ensure_remaining(buf, 28)?;
            let prev_log_index = LogIndex::new(buf.get_u64_le());
            let prev_log_term = TermId::new(buf.get_u64_le());
            let leader_commit = LogIndex::new(buf.get_u64_le());

            let entry_count = buf.get_u32_le() as usize;
            // Reject absurd counts before allocating.
            ensure_remaining(buf, entry_count.saturating_mul(ENTRY_HEADER_BYTES))?;
            let mut entries = Vec::with_capacity(entry_count);
            for _ in 0..entry_count {
                entries.push(decode_log_entry(buf)?);
            }

            Message::AppendEntries(AppendEntriesRequest {
                term,
                leader_id,
                to,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            })
        }
        TAG_APPEND_ENTRIES_RESPONSE => {
            let term = get_term(buf)?;
            let from = get_id(buf)?;
            let to = get_id(buf)?;
            ensure_remaining(buf, 9)?;
            Message::AppendEntriesResponse(AppendEntriesResponse {
                term,
                from,
                to,
                success: buf.get_u8() != 0,
                match_index: LogIndex::new(buf.get_u64_le()),
            })
        }
        TAG_INSTALL_SNAPSHOT => {
            let term = get_term(buf)?;
            let leader_id = get_id(buf)?;
            let to = get_id(buf)?;
            ensure_remaining(buf, 24)?;
            let last_included_index = LogIndex::new(buf.get_u64_le());
            let last_included_term = TermId::new(buf.get_u64_le());
            let configuration_index = LogIndex::new(buf.get_u64_le());
            let configuration = Configuration::decode_from(buf).ok_or(CodecError::Malformed {
                reason: "invalid snapshot configuration",
            })?;
            ensure_remaining(buf, 17)?;
            let checksum = buf.get_u32_le();
            let offset = buf.get_u64_le();
            let done = buf.get_u8() != 0;
            let data_len = buf.get_u32_le() as usize;
            ensure_remaining(buf, data_len)?;
            Message::InstallSnapshot(InstallSnapshotRequest {
                term,
                leader_id,
                to,
                meta: SnapshotMeta {
                    last_included_index,
                    last_included_term,
                    configuration,
                    configuration_index,
                },
                checksum,
                offset,
                data: buf.split_to(data_len),
                done,
            })
        }
        TAG_INSTALL_SNAPSHOT_RESPONSE => {
            let term = get_term(buf)?;
            let from = get_id(buf)?;
            let to = get_id(buf)?;
            ensure_remaining(buf, 18)?;
            Message::InstallSnapshotResponse(InstallSnapshotResponse {
                term,
                from,
                to,
                last_included_index: LogIndex::new(buf.get_u64_le()),
                next_offset: buf.get_u64_le(),
                done: buf.get_u8() != 0,
                success: buf.get_u8() != 0,
            })
        }
        _ => return Err(CodecError::UnknownMessageType { tag }),
    };

    Ok(message)
}

/// Encodes a log entry.
fn encode_log_entry(buf: &mut BytesMut, entry: &LogEntry) {
    buf.put_u64_le(entry.term.get());
    buf.put_u64_le(entry.index.get());
    buf.put_u8(entry.kind.to_u8());
    // Safe cast: entry data size is bounded by the frame limit which fits in u32.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(entry.data.len() as u32);
    buf.put_slice(&entry.data);
}

/// Decodes a log entry.
fn decode_log_entry(buf: &mut Bytes) -> CodecResult<LogEntry> {
    ensure_remaining(buf, ENTRY_HEADER_BYTES)?;

    let term = TermId::new(buf.get_u64_le());
    let index = LogIndex::new(buf.get_u64_le());
    let kind = EntryKind::from_u8(buf.get_u8()).ok_or(CodecError::Malformed {
        reason: "unknown entry kind",
    })?;
    let data_len = buf.get_u32_le() as usize;

    ensure_remaining(buf, data_len)?;
    let data = buf.split_to(data_len);

    Ok(LogEntry::with_kind(term, index, kind, data))
}

fn get_term(buf: &mut Bytes) -> CodecResult<TermId> {
    ensure_remaining(buf, 8)?;
    Ok(TermId::new(buf.get_u64_le()))
}

fn put_id(buf: &mut BytesMut, id: &ServerId) {
    put_str(buf, id.as_str());
}

fn get_id(buf: &mut Bytes) -> CodecResult<ServerId> {
    let raw = get_str(buf)?;
    ServerId::new(raw).map_err(|_| CodecError::Malformed {
        reason: "invalid server id",
    })
}

/// Writes a u16 length-prefixed UTF-8 string.
fn put_str(buf: &mut BytesMut, value: &str) {
    // Safe cast: ids and addresses are far below 64 KiB; longer values are
    // truncated to keep the frame well formed.
    #[allow(clippy::cast_possible_truncation)]
    let len = value.len().min(usize::from(u16::MAX)) as u16;
    buf.put_u16_le(len);
    buf.put_slice(&value.as_bytes()[..usize::from(len)]);
}

/// Reads a u16 length-prefixed UTF-8 string.
fn get_str(buf: &mut Bytes) -> CodecResult<String> {
    ensure_remaining(buf, 2)?;
    let len = usize::from(buf.get_u16_le());
    ensure_remaining(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::Malformed {
        reason: "invalid UTF-8",
    })
}

/// Ensures the buffer has at least `need` bytes remaining.
fn ensure_remaining(buf: &Bytes, need: usize) -> CodecResult<()> {
    if buf.remaining() < need {
        return Err(CodecError::InsufficientData {
            need,
            have: buf.remaining(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftcache_raft::{RaftConfig, RaftLog, ServerDescriptor};

    const MIB: usize = 1024 * 1024;

    fn id(name: &str) -> ServerId {
        ServerId::new(name).unwrap()
    }

    fn append_frame(entries: Vec<LogEntry>) -> Frame {
        raft_frame(Message::AppendEntries(AppendEntriesRequest {
            term: TermId::new(1),
            leader_id: id("a"),
            to: id("b"),
            prev_log_index: LogIndex::new(0),
            prev_log_term: TermId::new(0),
            entries,
            leader_commit: LogIndex::new(0),
        }))
    }

    fn raft_frame(message: Message) -> Frame {
        Frame::Raft {
            from_address: "10.0.0.1:7000".to_string(),
            message,
        }
    }

    fn assert_roundtrip(frame: &Frame) {
        let encoded = encode_frame(frame).unwrap();
        let (decoded, consumed) = decode_frame(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(&decoded, frame);
    }

    #[test]
    fn test_append_entries_with_mixed_entries() {
        let config = Configuration::new(vec![ServerDescriptor::voter(id("a"), "a:1")]).unwrap();
        let frame = raft_frame(Message::AppendEntries(AppendEntriesRequest {
            term: TermId::new(3),
            leader_id: id("a"),
            to: id("b"),
            prev_log_index: LogIndex::new(7),
            prev_log_term: TermId::new(2),
            entries: vec![
                LogEntry::new(TermId::new(3), LogIndex::new(8), Bytes::from("set")),
                LogEntry::noop(TermId::new(3), LogIndex::new(9)),
                LogEntry::configuration(TermId::new(3), LogIndex::new(10), &config),
            ],
            leader_commit: LogIndex::new(6),
        }));
        assert_roundtrip(&frame);
    }

    #[test]
    fn test_install_snapshot_chunk_frame() {
        let config = Configuration::new(vec![
            ServerDescriptor::voter(id("a"), "a:1"),
            ServerDescriptor::non_voter(id("b"), "b:1"),
        ])
        .unwrap();
        assert_roundtrip(&raft_frame(Message::InstallSnapshot(InstallSnapshotRequest {
            term: TermId::new(4),
            leader_id: id("a"),
            to: id("b"),
            meta: SnapshotMeta {
                last_included_index: LogIndex::new(40),
                last_included_term: TermId::new(4),
                configuration: config,
                configuration_index: LogIndex::new(12),
            },
            checksum: 0xDEAD_BEEF,
            offset: 3 * 1024 * 1024,
            data: Bytes::from_static(b"bucket image"),
            done: true,
        })));
        assert_roundtrip(&raft_frame(Message::InstallSnapshotResponse(
            InstallSnapshotResponse {
                term: TermId::new(4),
                from: id("b"),
                to: id("a"),
                last_included_index: LogIndex::new(40),
                next_offset: 1024,
                done: false,
                success: true,
            },
        )));
    }

    #[test]
    fn test_unbounded_batch_exceeds_frame() {
        let entries: Vec<LogEntry> = (1..=17)
            .map(|i| LogEntry::new(TermId::new(1), LogIndex::new(i), Bytes::from(vec![0_u8; MIB])))
            .collect();
        let result = encode_frame(&append_frame(entries));
        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_default_budgets_fit_in_frame() {
        let mut log = RaftLog::new();
        for i in 1..=40 {
            log.append(LogEntry::new(
                TermId::new(1),
                LogIndex::new(i),
                Bytes::from(vec![0_u8; MIB]),
            ));
        }
        let config = RaftConfig::new(id("a"));
        let batch = log.entries_from(
            LogIndex::new(1),
            config.max_entries_per_append as usize,
            config.max_append_bytes as usize,
        );
        assert!(batch.len() < 40);
        let encoded = encode_frame(&append_frame(batch)).unwrap();
        assert!(encoded.len() <= MAX_FRAME_BYTES as usize);

        let chunk = Bytes::from(vec![0_u8; config.snapshot_chunk_bytes as usize]);
        let meta = SnapshotMeta {
            last_included_index: LogIndex::new(40),
            last_included_term: TermId::new(1),
            configuration: Configuration::new(vec![ServerDescriptor::voter(id("a"), "a:1")])
                .unwrap(),
            configuration_index: LogIndex::new(1),
        };
        let frame = raft_frame(Message::InstallSnapshot(InstallSnapshotRequest {
            term: TermId::new(1),
            leader_id: id("a"),
            to: id("b"),
            meta,
            checksum: 0,
            offset: 0,
            data: chunk,
            done: false,
        }));
        assert!(encode_frame(&frame).is_ok());
    }

    #[test]
    fn test_rpc_frames_keep_body() {
        assert_roundtrip(&Frame::Request {
            request_id: 42,
            body: Bytes::from_static(b"\x01payload"),
        });
        assert_roundtrip(&Frame::Response {
            request_id: u64::MAX,
            body: Bytes::new(),
        });
    }

    #[test]
    fn test_partial_frame_needs_more_data() {
        let encoded = encode_frame(&raft_frame(Message::RequestVoteResponse(
            RequestVoteResponse {
                term: TermId::new(1),
                from: id("b"),
                to: id("a"),
                vote_granted: true,
            },
        )))
        .unwrap();

        let result = decode_frame(&encoded[..encoded.len() - 1]);
        assert!(matches!(result, Err(CodecError::InsufficientData { .. })));
        assert!(matches!(
            decode_frame(&encoded[..2]),
            Err(CodecError::InsufficientData { need: 4, have: 2 })
        ));
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let first = Frame::Request {
            request_id: 1,
            body: Bytes::from_static(b"one"),
        };
        let second = Frame::Response {
            request_id: 2,
            body: Bytes::from_static(b"two"),
        };
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&first).unwrap());
        buf.extend_from_slice(&encode_frame(&second).unwrap());

        let (decoded, consumed) = decode_frame(&buf).unwrap();
        assert_eq!(decoded, first);
        let (decoded, _) = decode_frame(&buf[consumed..]).unwrap();
        assert_eq!(decoded, second);
    }

    #[test]
    fn test_unknown_frame_kind() {
        let data = [1, 0, 0, 0, 99];
        assert!(matches!(
            decode_frame(&data),
            Err(CodecError::UnknownFrameKind { kind: 99 })
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let data = (MAX_FRAME_BYTES + 1).to_le_bytes();
        assert!(matches!(
            decode_frame(&data),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_invalid_server_id_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        buf.put_u8(FRAME_RAFT);
        put_str(&mut buf, "a:1");
        buf.put_u8(TAG_REQUEST_VOTE_RESPONSE);
        buf.put_u64_le(1);
        put_str(&mut buf, "has space");
        put_str(&mut buf, "a");
        buf.put_u8(1);
        #[allow(clippy::cast_possible_truncation)]
        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        assert!(matches!(
            decode_frame(&buf),
            Err(CodecError::Malformed { .. })
        ));
    }
}
