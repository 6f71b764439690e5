//! System limits and configuration bounds.
//!
//! Every frame, name and value has an explicit maximum size. Requests that
//! exceed a limit are rejected before they reach the replicated log.

/// Maximum size of a single transport frame in bytes (16 MiB).
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Bytes of every frame reserved for the frame header, addresses, ids and
/// message fields around the payload.
pub const FRAME_HEADROOM_BYTES: u32 = 64 * 1024;

/// Largest payload (log entries or a snapshot chunk) one frame may carry.
pub const MAX_FRAME_PAYLOAD_BYTES: u32 = MAX_FRAME_BYTES - FRAME_HEADROOM_BYTES;

/// Bytes a command adds around its bucket name, key and value.
const COMMAND_OVERHEAD_BYTES: u64 = 64;

/// Limits applied to cache data and Raft replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum length of a bucket name in bytes.
    pub max_bucket_name_bytes: u32,
    /// Maximum length of a key in bytes.
    pub max_key_bytes: u32,
    /// Maximum length of a value in bytes.
    pub max_value_bytes: u32,

    /// Maximum number of servers (voters and non-voters) in a configuration.
    pub max_cluster_size: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Names: 256 bytes, keys: 1 KiB, values: 1 MiB.
            max_bucket_name_bytes: 256,
            max_key_bytes: 1024,
            max_value_bytes: 1024 * 1024,

            max_cluster_size: 9,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limit is zero or the largest command cannot
    /// fit in a frame.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_bucket_name_bytes == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_bucket_name_bytes",
                reason: "must be positive",
            });
        }

        if self.max_key_bytes == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_key_bytes",
                reason: "must be positive",
            });
        }

        // A batch always carries at least one entry, so the largest command
        // must fit in a frame on its own.
        if self.max_command_bytes() > u64::from(MAX_FRAME_PAYLOAD_BYTES) {
            return Err(crate::Error::InvalidArgument {
                name: "max_value_bytes",
                reason: "largest command must fit in MAX_FRAME_PAYLOAD_BYTES",
            });
        }

        if self.max_cluster_size == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_cluster_size",
                reason: "must be positive",
            });
        }

        Ok(())
    }

    /// Returns the encoded size of the largest command these limits accept.
    #[must_use]
    pub const fn max_command_bytes(&self) -> u64 {
        self.max_bucket_name_bytes as u64
            + self.max_key_bytes as u64
            + self.max_value_bytes as u64
            + COMMAND_OVERHEAD_BYTES
    }

    /// Checks a length against one of the limits.
    ///
    /// # Errors
    /// Returns `LimitExceeded` naming `limit` if `actual > max`.
    pub fn check(limit: &'static str, max: u32, actual: usize) -> crate::Result<()> {
        // Safe cast: usize always fits in u64 on supported targets.
        #[allow(clippy::cast_possible_truncation)]
        let actual = actual as u64;
        if actual > u64::from(max) {
            return Err(crate::Error::LimitExceeded {
                limit,
                max: u64::from(max),
                actual,
            });
        }
        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}
