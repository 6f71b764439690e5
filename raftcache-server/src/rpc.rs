//! Request and response bodies carried by transport RPC frames.
//!
//! ```text
//! Request:  [tag: u8][fields...]
//! Response: [tag: u8][fields...]
//! ```
//!
//! Errors travel as a `Response::Error` carrying an encoded [`CacheError`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::CacheError;
use crate::wire::{get_opt_str, get_str, get_u64, get_u8, put_opt_str, put_str};

/// A member as reported by `GetConfiguration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Server id.
    pub id: String,
    /// Server address.
    pub address: String,
}

/// Suffrage chosen for a joining server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinedAs {
    /// Added as a voter.
    Voter,
    /// Added as a non-voter.
    NonVoter,
}

impl JoinedAs {
    /// Returns the state name reported to operators.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Voter => "voter",
            Self::NonVoter => "non-voter",
        }
    }
}

/// RPC requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Who is the leader?
    GetLeader,
    /// Current configuration split by suffrage.
    GetConfiguration,
    /// Role of the receiving node.
    GetState,
    /// Add a server, choosing suffrage from the voter allow-list.
    Join {
        /// Server id.
        id: String,
        /// Server address.
        address: String,
    },
    /// Add a voter.
    AddVoter {
        /// Server id.
        id: String,
        /// Server address.
        address: String,
        /// Configuration index the caller last saw; 0 skips the check.
        previous_index: u64,
    },
    /// Add a non-voter.
    AddNonVoter {
        /// Server id.
        id: String,
        /// Server address.
        address: String,
        /// Configuration index the caller last saw; 0 skips the check.
        previous_index: u64,
    },
    /// Remove a server.
    RemoveServer {
        /// Server id.
        id: String,
        /// Configuration index the caller last saw; 0 skips the check.
        previous_index: u64,
    },
    /// Make a server a voter in one configuration entry.
    PromoteServer {
        /// Server id.
        id: String,
        /// Server address.
        address: String,
        /// Configuration index the caller last saw; 0 skips the check.
        previous_index: u64,
    },
    /// Add a server keeping the voter count odd.
    AddPeer {
        /// Server id.
        id: String,
        /// Server address.
        address: String,
    },
    /// Write a value.
    Put {
        /// Bucket name.
        bucket: String,
        /// Key.
        key: String,
        /// Value.
        value: String,
        /// Set when a follower relayed the request to its leader.
        forwarded: bool,
    },
    /// Create a bucket.
    CreateBucket {
        /// Bucket name.
        bucket: String,
        /// Set when a follower relayed the request to its leader.
        forwarded: bool,
    },
    /// Read a value from the receiving node's store.
    Get {
        /// Bucket name.
        bucket: String,
        /// Key.
        key: String,
    },
}

/// RPC responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Answer to `GetLeader`.
    Leader(Option<Member>),
    /// Answer to `GetConfiguration`.
    Configuration {
        /// Voting members.
        voters: Vec<Member>,
        /// Non-voting members.
        non_voters: Vec<Member>,
    },
    /// Answer to `GetState`.
    State(String),
    /// Answer to `Join`.
    Joined {
        /// Index of the configuration entry.
        index: u64,
        /// Suffrage chosen.
        joined_as: JoinedAs,
    },
    /// Index of a committed configuration entry.
    Index(u64),
    /// A write committed.
    Done,
    /// Answer to `Get`.
    Value(Option<String>),
    /// The request failed.
    Error(CacheError),
}

/// Errors decoding an RPC body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcDecodeError {
    /// Unknown message tag.
    #[error("unknown rpc tag {tag}")]
    UnknownTag {
        /// The tag byte.
        tag: u8,
    },
    /// The body ended early or held invalid data.
    #[error("malformed rpc body")]
    Malformed,
    /// Bytes remained after the last field.
    #[error("{remaining} trailing bytes after rpc body")]
    TrailingBytes {
        /// Number of unread bytes.
        remaining: usize,
    },
}

type DecodeResult<T> = Result<T, RpcDecodeError>;

fn malformed<T>(value: Option<T>) -> DecodeResult<T> {
    value.ok_or(RpcDecodeError::Malformed)
}

fn finish<T>(data: &[u8], value: T) -> DecodeResult<T> {
    if data.is_empty() {
        Ok(value)
    } else {
        Err(RpcDecodeError::TrailingBytes {
            remaining: data.len(),
        })
    }
}

fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

fn get_bool(buf: &mut &[u8]) -> DecodeResult<bool> {
    match get_u8(buf) {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        _ => Err(RpcDecodeError::Malformed),
    }
}

fn string(buf: &mut &[u8]) -> DecodeResult<String> {
    malformed(get_str(buf))
}

fn index(buf: &mut &[u8]) -> DecodeResult<u64> {
    malformed(get_u64(buf))
}

impl Request {
    const GET_LEADER: u8 = 1;
    const GET_CONFIGURATION: u8 = 2;
    const GET_STATE: u8 = 3;
    const JOIN: u8 = 4;
    const ADD_VOTER: u8 = 5;
    const ADD_NON_VOTER: u8 = 6;
    const REMOVE_SERVER: u8 = 7;
    const PROMOTE_SERVER: u8 = 8;
    const ADD_PEER: u8 = 9;
    const PUT: u8 = 10;
    const CREATE_BUCKET: u8 = 11;
    const GET: u8 = 12;

    /// Encodes the request.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::GetLeader => buf.put_u8(Self::GET_LEADER),
            Self::GetConfiguration => buf.put_u8(Self::GET_CONFIGURATION),
            Self::GetState => buf.put_u8(Self::GET_STATE),
            Self::Join { id, address } => {
                buf.put_u8(Self::JOIN);
                put_str(&mut buf, id);
                put_str(&mut buf, address);
            }
            Self::AddVoter {
                id,
                address,
                previous_index,
            } => {
                buf.put_u8(Self::ADD_VOTER);
                put_str(&mut buf, id);
                put_str(&mut buf, address);
                buf.put_u64_le(*previous_index);
            }
            Self::AddNonVoter {
                id,
                address,
                previous_index,
            } => {
                buf.put_u8(Self::ADD_NON_VOTER);
                put_str(&mut buf, id);
                put_str(&mut buf, address);
                buf.put_u64_le(*previous_index);
            }
            Self::RemoveServer { id, previous_index } => {
                buf.put_u8(Self::REMOVE_SERVER);
                put_str(&mut buf, id);
                buf.put_u64_le(*previous_index);
            }
            Self::PromoteServer {
                id,
                address,
                previous_index,
            } => {
                buf.put_u8(Self::PROMOTE_SERVER);
                put_str(&mut buf, id);
                put_str(&mut buf, address);
                buf.put_u64_le(*previous_index);
            }
            Self::AddPeer { id, address } => {
                buf.put_u8(Self::ADD_PEER);
                put_str(&mut buf, id);
                put_str(&mut buf, address);
            }
            Self::Put {
                bucket,
                key,
                value,
                forwarded,
            } => {
                buf.put_u8(Self::PUT);
                put_str(&mut buf, bucket);
                put_str(&mut buf, key);
                put_str(&mut buf, value);
                put_bool(&mut buf, *forwarded);
            }
            Self::CreateBucket { bucket, forwarded } => {
                buf.put_u8(Self::CREATE_BUCKET);
                put_str(&mut buf, bucket);
                put_bool(&mut buf, *forwarded);
            }
            Self::Get { bucket, key } => {
                buf.put_u8(Self::GET);
                put_str(&mut buf, bucket);
                put_str(&mut buf, key);
            }
        }
        buf.freeze()
    }

    /// Decodes a request body.
    ///
    /// # Errors
    /// Returns an error if the body is malformed.
    pub fn decode(mut data: &[u8]) -> DecodeResult<Self> {
        let buf = &mut data;
        let tag = malformed(get_u8(buf))?;
        let request = match tag {
            Self::GET_LEADER => Self::GetLeader,
            Self::GET_CONFIGURATION => Self::GetConfiguration,
            Self::GET_STATE => Self::GetState,
            Self::JOIN => Self::Join {
                id: string(buf)?,
                address: string(buf)?,
            },
            Self::ADD_VOTER => Self::AddVoter {
                id: string(buf)?,
                address: string(buf)?,
                previous_index: index(buf)?,
            },
            Self::ADD_NON_VOTER => Self::AddNonVoter {
                id: string(buf)?,
                address: string(buf)?,
                previous_index: index(buf)?,
            },
            Self::REMOVE_SERVER => Self::RemoveServer {
                id: string(buf)?,
                previous_index: index(buf)?,
            },
            Self::PROMOTE_SERVER => Self::PromoteServer {
                id: string(buf)?,
                address: string(buf)?,
                previous_index: index(buf)?,
            },
            Self::ADD_PEER => Self::AddPeer {
                id: string(buf)?,
                address: string(buf)?,
            },
            Self::PUT => Self::Put {
                bucket: string(buf)?,
                key: string(buf)?,
                value: string(buf)?,
                forwarded: get_bool(buf)?,
            },
            Self::CREATE_BUCKET => Self::CreateBucket {
                bucket: string(buf)?,
                forwarded: get_bool(buf)?,
            },
            Self::GET => Self::Get {
                bucket: string(buf)?,
                key: string(buf)?,
            },
            tag => return Err(RpcDecodeError::UnknownTag { tag }),
        };
        finish(data, request)
    }
}

impl Response {
    const LEADER: u8 = 1;
    const CONFIGURATION: u8 = 2;
    const STATE: u8 = 3;
    const JOINED: u8 = 4;
    const INDEX: u8 = 5;
    const DONE: u8 = 6;
    const VALUE: u8 = 7;
    const ERROR: u8 = 8;

    /// Encodes the response.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Leader(leader) => {
                buf.put_u8(Self::LEADER);
                match leader {
                    Some(member) => {
                        buf.put_u8(1);
                        put_member(&mut buf, member);
                    }
                    None => buf.put_u8(0),
                }
            }
            Self::Configuration { voters, non_voters } => {
                buf.put_u8(Self::CONFIGURATION);
                put_members(&mut buf, voters);
                put_members(&mut buf, non_voters);
            }
            Self::State(state) => {
                buf.put_u8(Self::STATE);
                put_str(&mut buf, state);
            }
            Self::Joined { index, joined_as } => {
                buf.put_u8(Self::JOINED);
                buf.put_u64_le(*index);
                put_bool(&mut buf, *joined_as == JoinedAs::Voter);
            }
            Self::Index(index) => {
                buf.put_u8(Self::INDEX);
                buf.put_u64_le(*index);
            }
            Self::Done => buf.put_u8(Self::DONE),
            Self::Value(value) => {
                buf.put_u8(Self::VALUE);
                put_opt_str(&mut buf, value.as_deref());
            }
            Self::Error(err) => {
                buf.put_u8(Self::ERROR);
                put_error(&mut buf, err);
            }
        }
        buf.freeze()
    }

    /// Decodes a response body.
    ///
    /// # Errors
    /// Returns an error if the body is malformed.
    pub fn decode(mut data: &[u8]) -> DecodeResult<Self> {
        let buf = &mut data;
        let tag = malformed(get_u8(buf))?;
        let response = match tag {
            Self::LEADER => {
                if get_bool(buf)? {
                    Self::Leader(Some(get_member(buf)?))
                } else {
                    Self::Leader(None)
                }
            }
            Self::CONFIGURATION => Self::Configuration {
                voters: get_members(buf)?,
                non_voters: get_members(buf)?,
            },
            Self::STATE => Self::State(string(buf)?),
            Self::JOINED => Self::Joined {
                index: index(buf)?,
                joined_as: if get_bool(buf)? {
                    JoinedAs::Voter
                } else {
                    JoinedAs::NonVoter
                },
            },
            Self::INDEX => Self::Index(index(buf)?),
            Self::DONE => Self::Done,
            Self::VALUE => Self::Value(malformed(get_opt_str(buf))?),
            Self::ERROR => Self::Error(get_error(buf)?),
            tag => return Err(RpcDecodeError::UnknownTag { tag }),
        };
        finish(data, response)
    }

    /// Builds a response from a handler result.
    pub fn from_result<T>(result: Result<T, CacheError>, ok: impl FnOnce(T) -> Self) -> Self {
        result.map_or_else(Self::Error, ok)
    }
}

fn put_member(buf: &mut BytesMut, member: &Member) {
    put_str(buf, &member.id);
    put_str(buf, &member.address);
}

fn get_member(buf: &mut &[u8]) -> DecodeResult<Member> {
    Ok(Member {
        id: string(buf)?,
        address: string(buf)?,
    })
}

fn put_members(buf: &mut BytesMut, members: &[Member]) {
    // Safe cast: membership is bounded by `Limits::max_cluster_size`.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(members.len() as u32);
    for member in members {
        put_member(buf, member);
    }
}

fn get_members(buf: &mut &[u8]) -> DecodeResult<Vec<Member>> {
    if buf.remaining() < 4 {
        return Err(RpcDecodeError::Malformed);
    }
    let count = buf.get_u32_le();
    (0..count).map(|_| get_member(buf)).collect()
}

const ERR_NOT_LEADER: u8 = 1;
const ERR_NO_LEADER: u8 = 2;
const ERR_RETRY: u8 = 3;
const ERR_COMMIT_TIMEOUT: u8 = 4;
const ERR_LEADERSHIP_LOST: u8 = 5;
const ERR_CONFIGURATION_CONFLICT: u8 = 6;
const ERR_INVALID_CONFIGURATION: u8 = 7;
const ERR_BUCKET_NOT_FOUND: u8 = 8;
const ERR_BUCKET_EXISTS: u8 = 9;
const ERR_BAD_REQUEST: u8 = 10;
const ERR_STORAGE: u8 = 11;
const ERR_RPC: u8 = 12;
const ERR_INTERNAL: u8 = 13;

fn put_error(buf: &mut BytesMut, err: &CacheError) {
    match err {
        CacheError::NotLeader { leader_hint } => {
            buf.put_u8(ERR_NOT_LEADER);
            put_opt_str(buf, leader_hint.as_deref());
        }
        CacheError::NoLeader => buf.put_u8(ERR_NO_LEADER),
        CacheError::Retry => buf.put_u8(ERR_RETRY),
        CacheError::CommitTimeout => buf.put_u8(ERR_COMMIT_TIMEOUT),
        CacheError::LeadershipLost => buf.put_u8(ERR_LEADERSHIP_LOST),
        CacheError::ConfigurationConflict { expected, latest } => {
            buf.put_u8(ERR_CONFIGURATION_CONFLICT);
            buf.put_u64_le(*expected);
            buf.put_u64_le(*latest);
        }
        CacheError::InvalidConfiguration { reason } => {
            buf.put_u8(ERR_INVALID_CONFIGURATION);
            put_str(buf, reason);
        }
        CacheError::BucketNotFound { bucket } => {
            buf.put_u8(ERR_BUCKET_NOT_FOUND);
            put_str(buf, bucket);
        }
        CacheError::BucketExists { bucket } => {
            buf.put_u8(ERR_BUCKET_EXISTS);
            put_str(buf, bucket);
        }
        CacheError::BadRequest { reason } => {
            buf.put_u8(ERR_BAD_REQUEST);
            put_str(buf, reason);
        }
        CacheError::Storage { message } => {
            buf.put_u8(ERR_STORAGE);
            put_str(buf, message);
        }
        CacheError::Rpc { message } => {
            buf.put_u8(ERR_RPC);
            put_str(buf, message);
        }
        CacheError::Internal { message } => {
            buf.put_u8(ERR_INTERNAL);
            put_str(buf, message);
        }
    }
}

fn get_error(buf: &mut &[u8]) -> DecodeResult<CacheError> {
    let err = match malformed(get_u8(buf))? {
        ERR_NOT_LEADER => CacheError::NotLeader {
            leader_hint: malformed(get_opt_str(buf))?,
        },
        ERR_NO_LEADER => CacheError::NoLeader,
        ERR_RETRY => CacheError::Retry,
        ERR_COMMIT_TIMEOUT => CacheError::CommitTimeout,
        ERR_LEADERSHIP_LOST => CacheError::LeadershipLost,
        ERR_CONFIGURATION_CONFLICT => CacheError::ConfigurationConflict {
            expected: index(buf)?,
            latest: index(buf)?,
        },
        ERR_INVALID_CONFIGURATION => CacheError::InvalidConfiguration {
            reason: string(buf)?,
        },
        ERR_BUCKET_NOT_FOUND => CacheError::BucketNotFound {
            bucket: string(buf)?,
        },
        ERR_BUCKET_EXISTS => CacheError::BucketExists {
            bucket: string(buf)?,
        },
        ERR_BAD_REQUEST => CacheError::BadRequest {
            reason: string(buf)?,
        },
        ERR_STORAGE => CacheError::Storage {
            message: string(buf)?,
        },
        ERR_RPC => CacheError::Rpc {
            message: string(buf)?,
        },
        ERR_INTERNAL => CacheError::Internal {
            message: string(buf)?,
        },
        tag => return Err(RpcDecodeError::UnknownTag { tag }),
    };
    Ok(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_flag_survives_encoding() {
        let request = Request::Put {
            bucket: "b".to_string(),
            key: "k".to_string(),
            value: "v".to_string(),
            forwarded: true,
        };
        assert_eq!(Request::decode(&request.encode()).unwrap(), request);

        let request = Request::CreateBucket {
            bucket: "b".to_string(),
            forwarded: false,
        };
        assert_eq!(Request::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn test_configuration_response() {
        let response = Response::Configuration {
            voters: vec![
                Member {
                    id: "cache-0".to_string(),
                    address: "10.0.0.1:7000".to_string(),
                },
                Member {
                    id: "cache-1".to_string(),
                    address: "10.0.0.2:7000".to_string(),
                },
            ],
            non_voters: vec![Member {
                id: "cache-2".to_string(),
                address: "10.0.0.3:7000".to_string(),
            }],
        };
        assert_eq!(Response::decode(&response.encode()).unwrap(), response);
    }

    #[test]
    fn test_errors_keep_their_payload() {
        for err in [
            CacheError::NotLeader {
                leader_hint: Some("cache-0".to_string()),
            },
            CacheError::NotLeader { leader_hint: None },
            CacheError::Retry,
            CacheError::ConfigurationConflict {
                expected: 4,
                latest: 9,
            },
            CacheError::BucketNotFound {
                bucket: "sessions".to_string(),
            },
        ] {
            let response = Response::Error(err);
            assert_eq!(Response::decode(&response.encode()).unwrap(), response);
        }
    }

    #[test]
    fn test_malformed_bodies_rejected() {
        assert_eq!(
            Request::decode(&[99]),
            Err(RpcDecodeError::UnknownTag { tag: 99 })
        );
        assert_eq!(Request::decode(&[]), Err(RpcDecodeError::Malformed));

        let encoded = Request::Get {
            bucket: "b".to_string(),
            key: "k".to_string(),
        }
        .encode();
        assert_eq!(
            Request::decode(&encoded[..encoded.len() - 1]),
            Err(RpcDecodeError::Malformed)
        );

        let mut padded = Response::Done.encode().to_vec();
        padded.push(7);
        assert_eq!(
            Response::decode(&padded),
            Err(RpcDecodeError::TrailingBytes { remaining: 1 })
        );
    }
}
