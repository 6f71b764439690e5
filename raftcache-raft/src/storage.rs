//! Raft persistent storage abstraction.
//!
//! The state that must survive a crash:
//!
//! - **currentTerm**: The latest term the server has seen
//! - **votedFor**: The candidate that received our vote in the current term
//! - **log[]**: The entries after the latest snapshot
//! - **snapshot**: The latest state machine image and its configuration
//!
//! `RaftNode` writes through this trait before releasing any output that
//! depends on the write, so implementations must be durable when a method
//! returns `Ok`.

use bytes::{Buf, BufMut, BytesMut};
use raftcache_core::{LogIndex, ServerId, TermId};
use thiserror::Error;

use crate::log::LogEntry;
use crate::snapshot::Snapshot;

/// Persistent Raft state that must survive crashes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistentState {
    /// Latest term server has seen (initialized to 0, increases monotonically).
    pub current_term: TermId,
    /// Candidate that received our vote in the current term, if any.
    pub voted_for: Option<ServerId>,
}

impl PersistentState {
    /// Creates a persistent state with the given values.
    #[must_use]
    pub const fn new(current_term: TermId, voted_for: Option<ServerId>) -> Self {
        Self {
            current_term,
            voted_for,
        }
    }

    /// Encodes the persistent state to bytes.
    ///
    /// Format: term (8 bytes) + `voted_for` length (2 bytes, 0 if none) +
    /// `voted_for` (UTF-8).
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.current_term.get());
        match &self.voted_for {
            Some(id) => {
                // Safe cast: server ids are at most 128 bytes.
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u16_le(id.as_str().len() as u16);
                buf.put_slice(id.as_str().as_bytes());
            }
            None => buf.put_u16_le(0),
        }
    }

    /// Decodes persistent state from bytes.
    ///
    /// Returns `None` if the buffer is invalid.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 10 {
            return None;
        }

        let current_term = TermId::new(buf.get_u64_le());
        let len = buf.get_u16_le() as usize;
        let voted_for = if len == 0 {
            None
        } else {
            if buf.remaining() < len {
                return None;
            }
            let mut raw = vec![0u8; len];
            buf.copy_to_slice(&mut raw);
            Some(ServerId::new(String::from_utf8(raw).ok()?).ok()?)
        };

        Some(Self {
            current_term,
            voted_for,
        })
    }
}

/// Storage result type.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// I/O error during storage operation.
    #[error("storage I/O error during {operation}: {message}")]
    Io {
        /// The operation that failed.
        operation: &'static str,
        /// Error description.
        message: String,
    },
    /// Data corruption detected.
    #[error("storage corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },
    /// Entry not found in storage.
    #[error("entry not found at index {}", index.get())]
    NotFound {
        /// The index that was not found.
        index: LogIndex,
    },
}

impl StorageError {
    /// Wraps an I/O error with the operation that produced it.
    #[must_use]
    pub fn io(operation: &'static str, err: &std::io::Error) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }
}

/// Trait for Raft persistent storage.
///
/// Implementations must guarantee durability: data must survive crashes
/// after methods return successfully.
pub trait RaftStorage: Send {
    /// Saves the persistent state (term and `voted_for`).
    ///
    /// # Errors
    /// Returns an error if the state cannot be persisted.
    fn save_state(&mut self, state: &PersistentState) -> StorageResult<()>;

    /// Loads the persistent state.
    ///
    /// Returns `None` if no state has been saved (fresh start).
    ///
    /// # Errors
    /// Returns an error if the state cannot be loaded.
    fn load_state(&self) -> StorageResult<Option<PersistentState>>;

    /// Appends entries to the log.
    ///
    /// Entries must directly follow the current last entry.
    ///
    /// # Errors
    /// Returns an error if entries cannot be appended.
    fn append_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()>;

    /// Truncates the log after the given index.
    ///
    /// Keeps entries up to and including `last_to_keep`.
    ///
    /// # Errors
    /// Returns an error if truncation fails.
    fn truncate_after(&mut self, last_to_keep: LogIndex) -> StorageResult<()>;

    /// Loads all entries after the latest snapshot, in index order.
    ///
    /// # Errors
    /// Returns an error if the log cannot be read.
    fn load_entries(&self) -> StorageResult<Vec<LogEntry>>;

    /// Persists a snapshot and discards entries it covers.
    ///
    /// Entries after the snapshot's last included index are kept.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be persisted.
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> StorageResult<()>;

    /// Loads the latest snapshot, if any.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be read.
    fn load_snapshot(&self) -> StorageResult<Option<Snapshot>>;

    /// Returns true if any term, vote, entry or snapshot has been persisted.
    ///
    /// # Errors
    /// Returns an error if storage cannot be inspected.
    fn has_existing_state(&self) -> StorageResult<bool> {
        Ok(self.load_state()?.is_some()
            || self.load_snapshot()?.is_some()
            || !self.load_entries()?.is_empty())
    }
}

/// In-memory storage implementation for testing.
///
/// This implementation does NOT provide durability. It is used by unit tests
/// and the deterministic simulation, where a "crash" keeps the storage value
/// and drops everything else.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Option<PersistentState>,
    /// Entries after `snapshot`.
    entries: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
    fail_writes: bool,
}

impl MemoryStorage {
    /// Creates a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail, simulating a broken disk.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    fn check_writable(&self, operation: &'static str) -> StorageResult<()> {
        if self.fail_writes {
            return Err(StorageError::Io {
                operation,
                message: "injected write failure".to_string(),
            });
        }
        Ok(())
    }

    fn base_index(&self) -> u64 {
        self.snapshot
            .as_ref()
            .map_or(0, |s| s.last_included_index().get())
    }

    fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map_or_else(|| self.base_index(), |e| e.index.get())
    }
}

impl RaftStorage for MemoryStorage {
    fn save_state(&mut self, state: &PersistentState) -> StorageResult<()> {
        self.check_writable("save state")?;
        self.state = Some(state.clone());
        Ok(())
    }

    fn load_state(&self) -> StorageResult<Option<PersistentState>> {
        Ok(self.state.clone())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        self.check_writable("append entries")?;
        for entry in entries {
            let expected_index = self.last_index() + 1;
            if entry.index.get() != expected_index {
                return Err(StorageError::Corruption {
                    message: format!(
                        "non-sequential entry: expected {}, got {}",
                        expected_index,
                        entry.index.get()
                    ),
                });
            }
            self.entries.push(entry.clone());
        }
        Ok(())
    }

    fn truncate_after(&mut self, last_to_keep: LogIndex) -> StorageResult<()> {
        self.check_writable("truncate")?;
        self.entries.retain(|e| e.index <= last_to_keep);
        Ok(())
    }

    fn load_entries(&self) -> StorageResult<Vec<LogEntry>> {
        Ok(self.entries.clone())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> StorageResult<()> {
        self.check_writable("save snapshot")?;
        let index = snapshot.last_included_index();
        self.entries.retain(|e| e.index > index);
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> StorageResult<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }
}
