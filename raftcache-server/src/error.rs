//! Cache error types.

use raftcache_runtime::{ServerError, TransportError};
use thiserror::Error;

use crate::command::InvalidCommand;
use crate::fsm::{ApplyError, FsmError};
use crate::store::StoreError;

/// Errors returned by the router, the membership service and node startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// This node is not the leader. Returned instead of forwarding twice.
    #[error("not leader (leader hint: {leader_hint:?})")]
    NotLeader {
        /// Id of the leader this node believes in, if any.
        leader_hint: Option<String>,
    },

    /// No leader is known.
    #[error("no leader elected")]
    NoLeader,

    /// Role and leader disagreed for a moment; try again.
    #[error("leadership in transition, retry")]
    Retry,

    /// The write did not commit in time. Outcome unknown.
    #[error("commit timed out")]
    CommitTimeout,

    /// Leadership was lost before commit. Outcome unknown.
    #[error("leadership lost before commit")]
    LeadershipLost,

    /// The configuration changed since the caller read it.
    #[error("configuration conflict: expected index {expected}, latest is {latest}")]
    ConfigurationConflict {
        /// Index the caller expected.
        expected: u64,
        /// Latest configuration index.
        latest: u64,
    },

    /// The membership change is not allowed.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Why.
        reason: String,
    },

    /// The bucket does not exist.
    #[error("bucket not found: {bucket}")]
    BucketNotFound {
        /// Bucket name.
        bucket: String,
    },

    /// The bucket already exists.
    #[error("bucket already exists: {bucket}")]
    BucketExists {
        /// Bucket name.
        bucket: String,
    },

    /// The request is malformed.
    #[error("bad request: {reason}")]
    BadRequest {
        /// Why.
        reason: String,
    },

    /// Local storage failed.
    #[error("storage error: {message}")]
    Storage {
        /// Error description.
        message: String,
    },

    /// A call to another node failed.
    #[error("rpc error: {message}")]
    Rpc {
        /// Error description.
        message: String,
    },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl CacheError {
    /// Returns the HTTP status an external API should answer with.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::NotLeader { .. }
            | Self::NoLeader
            | Self::Retry
            | Self::LeadershipLost
            | Self::CommitTimeout => 503,
            Self::BucketNotFound { .. } => 404,
            Self::BadRequest { .. } => 400,
            Self::BucketExists { .. } | Self::ConfigurationConflict { .. } => 409,
            Self::InvalidConfiguration { .. }
            | Self::Storage { .. }
            | Self::Rpc { .. }
            | Self::Internal { .. } => 500,
        }
    }

    /// Returns true if the caller may retry, possibly elsewhere.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.http_status() == 503
    }
}

impl From<ServerError> for CacheError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::NotLeader { leader_hint } => Self::NotLeader {
                leader_hint: leader_hint.map(|id| id.as_str().to_string()),
            },
            ServerError::CommitTimeout => Self::CommitTimeout,
            ServerError::LeadershipLost => Self::LeadershipLost,
            ServerError::ConfigurationConflict { expected, latest } => {
                Self::ConfigurationConflict {
                    expected: expected.get(),
                    latest: latest.get(),
                }
            }
            ServerError::InvalidConfiguration { reason } => Self::InvalidConfiguration { reason },
            other @ (ServerError::AlreadyBootstrapped | ServerError::ServerUnavailable) => {
                Self::Internal {
                    message: other.to_string(),
                }
            }
            ServerError::Config(e) => Self::BadRequest {
                reason: e.to_string(),
            },
            ServerError::Fatal { message } => Self::Storage { message },
        }
    }
}

impl From<ApplyError> for CacheError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::BucketNotFound { bucket } => Self::BucketNotFound { bucket },
            ApplyError::BucketExists { bucket } => Self::BucketExists { bucket },
            ApplyError::Storage { message } => Self::Storage { message },
        }
    }
}

impl From<FsmError> for CacheError {
    fn from(err: FsmError) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        ApplyError::from(err).into()
    }
}

impl From<TransportError> for CacheError {
    fn from(err: TransportError) -> Self {
        Self::Rpc {
            message: err.to_string(),
        }
    }
}

impl From<InvalidCommand> for CacheError {
    fn from(err: InvalidCommand) -> Self {
        Self::BadRequest {
            reason: err.to_string(),
        }
    }
}
