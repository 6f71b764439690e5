//! Strongly-typed identifiers for Raft and cluster entities.
//!
//! Numeric ids (terms, log indexes) are zero-cost u64 wrappers. Server ids are
//! operator-chosen strings such as `node-0`, validated once on construction.

use std::fmt;

/// Macro to generate strongly-typed numeric wrappers.
///
/// Each type wraps a u64 and provides:
/// - Type safety (can't pass a `TermId` where a `LogIndex` is expected)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new value from a raw u64.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next value in sequence.
            ///
            /// # Panics
            /// Panics if the value would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }

            /// Returns the previous value, saturating at zero.
            #[inline]
            #[must_use]
            pub const fn prev(self) -> Self {
                Self(self.0.saturating_sub(1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(TermId, "term", "Raft term number for leader election.");
define_id!(LogIndex, "idx", "Index into the Raft log. The first entry is 1; 0 means none.");

/// Maximum length of a server id in bytes.
const SERVER_ID_BYTES_MAX: usize = 128;

/// Identity of a cluster member, unique within the cluster.
///
/// Ids are chosen by the operator (for example `cache-0`). They must be
/// non-empty, at most 128 bytes and free of whitespace and commas so that
/// voter allow-lists can be written as comma-separated strings.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(String);

impl ServerId {
    /// Creates a server id, validating its format.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the id is empty, too long or contains
    /// whitespace or commas.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidArgument {
                name: "server_id",
                reason: "must not be empty",
            });
        }
        if id.len() > SERVER_ID_BYTES_MAX {
            return Err(crate::Error::InvalidArgument {
                name: "server_id",
                reason: "must be at most 128 bytes",
            });
        }
        if id.chars().any(|c| c.is_whitespace() || c == ',') {
            return Err(crate::Error::InvalidArgument {
                name: "server_id",
                reason: "must not contain whitespace or commas",
            });
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the first ordinal of a stateful set (`*-0`).
    #[must_use]
    pub fn is_first_ordinal(&self) -> bool {
        self.0.ends_with("-0")
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server({})", self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ServerId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for ServerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
