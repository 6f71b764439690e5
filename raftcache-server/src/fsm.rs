//! The cache's replicated state machine.
//!
//! `CacheFsm` decodes committed commands and applies them to a bucket store.
//! Clones share the store: the raft actor applies, snapshots and restores
//! through one clone while the request router reads through another.
//!
//! A command that fails against the store (missing bucket, duplicate
//! bucket) is still applied: the error is part of its outcome and goes back
//! to the proposer. Only an undecodable command is fatal, since skipping it
//! would make replicas diverge.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use raftcache_core::LogIndex;
use raftcache_runtime::StateMachine;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::command::{Command, CommandDecodeError};
use crate::store::{BucketStore, StoreError, StoreImage};

/// Per-command failure, reported to the proposer without halting the log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// `Set` into a bucket that does not exist.
    #[error("bucket not found: {bucket}")]
    BucketNotFound {
        /// Bucket name.
        bucket: String,
    },
    /// `CreateBucket` for a bucket that already exists.
    #[error("bucket already exists: {bucket}")]
    BucketExists {
        /// Bucket name.
        bucket: String,
    },
    /// The store failed while applying this command.
    #[error("storage error: {message}")]
    Storage {
        /// Error description.
        message: String,
    },
}

impl From<StoreError> for ApplyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BucketNotFound { bucket } => Self::BucketNotFound { bucket },
            StoreError::BucketExists { bucket } => Self::BucketExists { bucket },
            other => Self::Storage {
                message: other.to_string(),
            },
        }
    }
}

/// Outcome of applying one command.
pub type ApplyOutcome = Result<(), ApplyError>;

/// Fatal state machine errors.
#[derive(Debug, Error)]
pub enum FsmError {
    /// A committed entry is not a valid command.
    #[error("undecodable command at index {index}: {source}")]
    Decode {
        /// Log index of the entry.
        index: LogIndex,
        /// Decode failure.
        source: CommandDecodeError,
    },

    /// Snapshot export or restore failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A thread panicked while holding the store lock.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Replicated state machine over a bucket store.
pub struct CacheFsm<B> {
    store: Arc<RwLock<B>>,
}

impl<B> Clone for CacheFsm<B> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<B> std::fmt::Debug for CacheFsm<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFsm").finish_non_exhaustive()
    }
}

impl<B: BucketStore> CacheFsm<B> {
    /// Wraps a store.
    #[must_use]
    pub fn new(store: B) -> Self {
        Self {
            store: Arc::new(RwLock::new(store)),
        }
    }

    /// Reads a value from the local store. May be stale on followers.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<String>, FsmError> {
        let store = self.store.read().map_err(|_| FsmError::Poisoned)?;
        Ok(store.get(bucket, key)?)
    }

    /// Exports the current store contents.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub fn image(&self) -> Result<StoreImage, FsmError> {
        let store = self.store.read().map_err(|_| FsmError::Poisoned)?;
        Ok(store.export()?)
    }

    fn apply_command(&self, index: LogIndex, command: &Command) -> Result<ApplyOutcome, FsmError> {
        let mut store = self.store.write().map_err(|_| FsmError::Poisoned)?;
        let result = match command {
            Command::Set { bucket, key, value } => store.put(bucket, key, value),
            Command::CreateBucket { bucket } => store.create_bucket(bucket),
        };

        let outcome = result.map_err(ApplyError::from);
        match &outcome {
            Ok(()) => debug!(index = index.get(), bucket = %command.bucket(), "Applied command"),
            Err(ApplyError::Storage { message }) => {
                error!(index = index.get(), error = %message, "Store failed applying command");
            }
            Err(e) => warn!(index = index.get(), error = %e, "Command rejected by store"),
        }
        Ok(outcome)
    }
}

impl<B: BucketStore> StateMachine for CacheFsm<B> {
    type Output = ApplyOutcome;
    type Error = FsmError;

    fn apply(&mut self, index: LogIndex, data: &[u8]) -> Result<ApplyOutcome, FsmError> {
        let command = Command::decode(data).map_err(|source| {
            error!(index = index.get(), error = %source, "Undecodable command in log");
            FsmError::Decode { index, source }
        })?;
        self.apply_command(index, &command)
    }

    fn snapshot(&mut self) -> Result<Bytes, FsmError> {
        Ok(self.image()?.encode())
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), FsmError> {
        let image = StoreImage::decode(data)?;
        let mut store = self.store.write().map_err(|_| FsmError::Poisoned)?;
        store.import(&image)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), FsmError> {
        let mut store = self.store.write().map_err(|_| FsmError::Poisoned)?;
        store.import(&StoreImage::default())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn apply(fsm: &mut CacheFsm<MemoryStore>, index: u64, command: &Command) -> ApplyOutcome {
        fsm.apply(LogIndex::new(index), &command.encode()).unwrap()
    }

    fn create(bucket: &str) -> Command {
        Command::CreateBucket {
            bucket: bucket.to_string(),
        }
    }

    fn set(bucket: &str, key: &str, value: &str) -> Command {
        Command::Set {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_apply_then_get() {
        let mut fsm = CacheFsm::new(MemoryStore::new());
        assert_eq!(apply(&mut fsm, 1, &create("b")), Ok(()));
        assert_eq!(apply(&mut fsm, 2, &set("b", "k", "v")), Ok(()));
        assert_eq!(fsm.get("b", "k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_per_command_errors_do_not_halt() {
        let mut fsm = CacheFsm::new(MemoryStore::new());
        assert_eq!(
            apply(&mut fsm, 1, &set("missing", "k", "v")),
            Err(ApplyError::BucketNotFound {
                bucket: "missing".to_string()
            })
        );
        assert_eq!(apply(&mut fsm, 2, &create("b")), Ok(()));
        assert_eq!(
            apply(&mut fsm, 3, &create("b")),
            Err(ApplyError::BucketExists {
                bucket: "b".to_string()
            })
        );
        assert_eq!(apply(&mut fsm, 4, &set("b", "k", "v")), Ok(()));
    }

    #[test]
    fn test_decode_failure_is_fatal() {
        let mut fsm = CacheFsm::new(MemoryStore::new());
        let result = fsm.apply(LogIndex::new(7), &[42]);
        assert!(matches!(
            result,
            Err(FsmError::Decode { index, .. }) if index == LogIndex::new(7)
        ));
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut fsm = CacheFsm::new(MemoryStore::new());
        apply(&mut fsm, 1, &create("b")).unwrap();
        apply(&mut fsm, 2, &set("b", "k1", "v1")).unwrap();
        apply(&mut fsm, 3, &set("b", "k2", "v2")).unwrap();
        let snapshot = fsm.snapshot().unwrap();

        let mut other = CacheFsm::new(MemoryStore::new());
        apply(&mut other, 1, &create("junk")).unwrap();
        other.restore(&snapshot).unwrap();

        assert_eq!(other.image().unwrap(), fsm.image().unwrap());
        assert_eq!(other.get("b", "k2").unwrap().as_deref(), Some("v2"));
        assert_eq!(other.get("junk", "x").unwrap(), None);
    }

    #[test]
    fn test_reset_clears_store() {
        let mut fsm = CacheFsm::new(MemoryStore::new());
        apply(&mut fsm, 1, &create("b")).unwrap();
        fsm.reset().unwrap();
        assert!(fsm.image().unwrap().buckets.is_empty());
    }

    #[test]
    fn test_clones_share_store() {
        let mut fsm = CacheFsm::new(MemoryStore::new());
        let reader = fsm.clone();
        apply(&mut fsm, 1, &create("b")).unwrap();
        apply(&mut fsm, 2, &set("b", "k", "v")).unwrap();
        assert_eq!(reader.get("b", "k").unwrap().as_deref(), Some("v"));
    }
}
