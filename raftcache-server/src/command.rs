//! Commands replicated through the Raft log.
//!
//! Wire format:
//!
//! ```text
//! Set:          [tag: 1][bucket: str][key: str][value: str]
//! CreateBucket: [tag: 2][bucket: str]
//! ```
//!
//! `str` is a u32 length followed by UTF-8 bytes. Decoding is strict: an
//! unknown tag, a short payload or trailing bytes is an error, never a no-op.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use raftcache_core::Limits;
use thiserror::Error;

use crate::wire::{get_str, get_u8, put_str};

const TAG_SET: u8 = 1;
const TAG_CREATE_BUCKET: u8 = 2;

/// A mutation of the bucket store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Writes `value` under `key` in an existing bucket.
    Set {
        /// Target bucket.
        bucket: String,
        /// Key within the bucket.
        key: String,
        /// New value.
        value: String,
    },
    /// Creates an empty bucket.
    CreateBucket {
        /// Bucket name.
        bucket: String,
    },
}

/// Errors decoding a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandDecodeError {
    /// The payload was empty.
    #[error("empty command payload")]
    Empty,
    /// Unknown command tag.
    #[error("unknown command tag {tag}")]
    UnknownTag {
        /// The tag byte.
        tag: u8,
    },
    /// A field was cut short or is not UTF-8.
    #[error("malformed {field} in command")]
    Malformed {
        /// Which field failed.
        field: &'static str,
    },
    /// Bytes remained after the last field.
    #[error("{remaining} trailing bytes after command")]
    TrailingBytes {
        /// Number of unread bytes.
        remaining: usize,
    },
}

/// Why a command was rejected before being proposed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct InvalidCommand {
    /// Offending field.
    pub field: &'static str,
    /// Description.
    pub reason: String,
}

impl Command {
    /// Returns the bucket this command targets.
    #[must_use]
    pub fn bucket(&self) -> &str {
        match self {
            Self::Set { bucket, .. } | Self::CreateBucket { bucket } => bucket,
        }
    }

    /// Encodes the command for the log.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Set { bucket, key, value } => {
                buf.reserve(1 + 12 + bucket.len() + key.len() + value.len());
                buf.put_u8(TAG_SET);
                put_str(&mut buf, bucket);
                put_str(&mut buf, key);
                put_str(&mut buf, value);
            }
            Self::CreateBucket { bucket } => {
                buf.put_u8(TAG_CREATE_BUCKET);
                put_str(&mut buf, bucket);
            }
        }
        buf.freeze()
    }

    /// Decodes a command from a log payload.
    ///
    /// # Errors
    /// Returns an error for an unknown tag, a truncated field or trailing
    /// bytes.
    pub fn decode(mut data: &[u8]) -> Result<Self, CommandDecodeError> {
        let tag = get_u8(&mut data).ok_or(CommandDecodeError::Empty)?;
        let command = match tag {
            TAG_SET => Self::Set {
                bucket: field(&mut data, "bucket")?,
                key: field(&mut data, "key")?,
                value: field(&mut data, "value")?,
            },
            TAG_CREATE_BUCKET => Self::CreateBucket {
                bucket: field(&mut data, "bucket")?,
            },
            tag => return Err(CommandDecodeError::UnknownTag { tag }),
        };

        if data.has_remaining() {
            return Err(CommandDecodeError::TrailingBytes {
                remaining: data.remaining(),
            });
        }
        Ok(command)
    }

    /// Checks names and sizes before the command is proposed.
    ///
    /// # Errors
    /// Returns the first field that is empty, contains NUL or exceeds its
    /// limit.
    pub fn validate(&self, limits: &Limits) -> Result<(), InvalidCommand> {
        validate_name("bucket", self.bucket(), limits.max_bucket_name_bytes)?;
        if let Self::Set { key, value, .. } = self {
            validate_name("key", key, limits.max_key_bytes)?;
            Limits::check("value_bytes", limits.max_value_bytes, value.len()).map_err(|e| {
                InvalidCommand {
                    field: "value",
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(())
    }
}

fn field(data: &mut &[u8], name: &'static str) -> Result<String, CommandDecodeError> {
    get_str(data).ok_or(CommandDecodeError::Malformed { field: name })
}

fn validate_name(field: &'static str, value: &str, max: u32) -> Result<(), InvalidCommand> {
    if value.is_empty() {
        return Err(InvalidCommand {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    // NUL separates bucket and key in the store's composite keys.
    if value.contains('\0') {
        return Err(InvalidCommand {
            field,
            reason: "must not contain NUL".to_string(),
        });
    }
    Limits::check(field, max, value.len()).map_err(|e| InvalidCommand {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(bucket: &str, key: &str, value: &str) -> Command {
        Command::Set {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_set_encoding_layout() {
        let encoded = set("b", "k", "v").encode();
        assert_eq!(
            &encoded[..],
            &[1, 1, 0, 0, 0, b'b', 1, 0, 0, 0, b'k', 1, 0, 0, 0, b'v']
        );
        assert_eq!(Command::decode(&encoded).unwrap(), set("b", "k", "v"));
    }

    #[test]
    fn test_create_bucket_decodes() {
        let command = Command::CreateBucket {
            bucket: "sessions".to_string(),
        };
        assert_eq!(Command::decode(&command.encode()).unwrap(), command);
    }

    #[test]
    fn test_unknown_tag_is_error() {
        assert_eq!(
            Command::decode(&[9, 0, 0, 0, 0]),
            Err(CommandDecodeError::UnknownTag { tag: 9 })
        );
        assert_eq!(Command::decode(&[]), Err(CommandDecodeError::Empty));
    }

    #[test]
    fn test_truncated_and_trailing_rejected() {
        let encoded = set("b", "k", "value").encode();
        assert_eq!(
            Command::decode(&encoded[..encoded.len() - 1]),
            Err(CommandDecodeError::Malformed { field: "value" })
        );

        let mut padded = encoded.to_vec();
        padded.push(0);
        assert_eq!(
            Command::decode(&padded),
            Err(CommandDecodeError::TrailingBytes { remaining: 1 })
        );
    }

    #[test]
    fn test_validate_names_and_limits() {
        let limits = Limits::new();
        assert!(set("b", "k", "v").validate(&limits).is_ok());
        assert_eq!(set("", "k", "v").validate(&limits).unwrap_err().field, "bucket");
        assert_eq!(set("b", "a\0b", "v").validate(&limits).unwrap_err().field, "key");

        let big = "x".repeat(limits.max_value_bytes as usize + 1);
        assert_eq!(set("b", "k", &big).validate(&limits).unwrap_err().field, "value");
    }
}
