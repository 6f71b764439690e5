//! Error type shared by the core types.
//!
//! Higher crates define their own `thiserror` enums and convert from this
//! one where a core value is rejected.

use std::fmt;

/// The result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A core value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A size bound was exceeded.
    LimitExceeded {
        /// Which limit, for example `value_bytes`.
        limit: &'static str,
        /// The bound.
        max: u64,
        /// The offending size.
        actual: u64,
    },

    /// A value is malformed.
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LimitExceeded { limit, max, actual } => {
                write!(f, "{limit} too large: {actual} > {max}")
            }
            Self::InvalidArgument { name, reason } => write!(f, "invalid {name}: {reason}"),
        }
    }
}

impl std::error::Error for Error {}
