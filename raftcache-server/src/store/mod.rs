//! Bucket stores: the data the replicated state machine applies commands to.
//!
//! A store maps bucket name to key to value. Every implementation exports
//! and imports the same [`StoreImage`], so a snapshot taken on one backend
//! restores on any other.
//!
//! # Image Format
//!
//! ```text
//! [magic: u32][bucket_count: u32]
//!   [bucket: str][entry_count: u32]
//!     [key: str][value: str] ...
//! ```

mod redb_store;

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::wire::{get_str, get_u32, put_str};

pub use redb_store::RedbStore;

/// Magic bytes at the start of a store image.
const IMAGE_MAGIC: u32 = 0x5243_4249; // "RCBI"

/// Errors from bucket store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
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

    /// The underlying database failed.
    #[error("database error: {message}")]
    Database {
        /// Error description.
        message: String,
    },

    /// A store image could not be decoded.
    #[error("corrupt store image: {reason}")]
    CorruptImage {
        /// What was wrong.
        reason: &'static str,
    },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage for buckets of key/value pairs.
///
/// Callers serialize writers; `get` may run alongside other `get`s.
pub trait BucketStore: Send + Sync + 'static {
    /// Reads a value. Returns `None` if the bucket or key is missing.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    fn get(&self, bucket: &str, key: &str) -> StoreResult<Option<String>>;

    /// Writes a value into an existing bucket.
    ///
    /// # Errors
    /// Returns `BucketNotFound` if the bucket does not exist.
    fn put(&mut self, bucket: &str, key: &str, value: &str) -> StoreResult<()>;

    /// Creates an empty bucket.
    ///
    /// # Errors
    /// Returns `BucketExists` if the bucket already exists.
    fn create_bucket(&mut self, bucket: &str) -> StoreResult<()>;

    /// Exports every bucket.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    fn export(&self) -> StoreResult<StoreImage>;

    /// Replaces the whole store with `image`. Either all of it is installed
    /// or nothing changes.
    ///
    /// # Errors
    /// Returns an error if the store cannot be written.
    fn import(&mut self, image: &StoreImage) -> StoreResult<()>;
}

/// The complete contents of a bucket store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreImage {
    /// Bucket name to key to value.
    pub buckets: BTreeMap<String, BTreeMap<String, String>>,
}

impl StoreImage {
    /// Encodes the image.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(IMAGE_MAGIC);
        // Safe cast: bucket and entry counts are bounded by the frame size.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.buckets.len() as u32);
        for (bucket, entries) in &self.buckets {
            put_str(&mut buf, bucket);
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(entries.len() as u32);
            for (key, value) in entries {
                put_str(&mut buf, key);
                put_str(&mut buf, value);
            }
        }
        buf.freeze()
    }

    /// Decodes an image produced by `encode`.
    ///
    /// # Errors
    /// Returns `CorruptImage` if the data is malformed.
    pub fn decode(mut data: &[u8]) -> StoreResult<Self> {
        let corrupt = |reason| StoreError::CorruptImage { reason };

        if get_u32(&mut data) != Some(IMAGE_MAGIC) {
            return Err(corrupt("bad magic"));
        }
        let bucket_count = get_u32(&mut data).ok_or_else(|| corrupt("missing bucket count"))?;

        let mut buckets = BTreeMap::new();
        for _ in 0..bucket_count {
            let bucket = get_str(&mut data).ok_or_else(|| corrupt("bad bucket name"))?;
            let entry_count = get_u32(&mut data).ok_or_else(|| corrupt("missing entry count"))?;
            let mut entries = BTreeMap::new();
            for _ in 0..entry_count {
                let key = get_str(&mut data).ok_or_else(|| corrupt("bad key"))?;
                let value = get_str(&mut data).ok_or_else(|| corrupt("bad value"))?;
                entries.insert(key, value);
            }
            buckets.insert(bucket, entries);
        }

        if !data.is_empty() {
            return Err(corrupt("trailing bytes"));
        }
        Ok(Self { buckets })
    }
}

/// In-memory bucket store, used by tests and the simulation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    image: StoreImage,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BucketStore for MemoryStore {
    fn get(&self, bucket: &str, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .image
            .buckets
            .get(bucket)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn put(&mut self, bucket: &str, key: &str, value: &str) -> StoreResult<()> {
        let entries =
            self.image
                .buckets
                .get_mut(bucket)
                .ok_or_else(|| StoreError::BucketNotFound {
                    bucket: bucket.to_string(),
                })?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn create_bucket(&mut self, bucket: &str) -> StoreResult<()> {
        if self.image.buckets.contains_key(bucket) {
            return Err(StoreError::BucketExists {
                bucket: bucket.to_string(),
            });
        }
        self.image.buckets.insert(bucket.to_string(), BTreeMap::new());
        Ok(())
    }

    fn export(&self) -> StoreResult<StoreImage> {
        Ok(self.image.clone())
    }

    fn import(&mut self, image: &StoreImage) -> StoreResult<()> {
        self.image = image.clone();
        Ok(())
    }
}
