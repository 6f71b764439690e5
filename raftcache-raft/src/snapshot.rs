//! Raft snapshots and their on-disk store.
//!
//! A snapshot captures the state machine image after applying every entry up
//! to `last_included_index`, together with the latest configuration at or
//! before that index. Snapshots are written to `<term>-<index>.snap` files
//! with the usual temp-file, fsync, rename sequence; only the newest few are
//! kept.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use raftcache_core::{LogIndex, TermId};
use tracing::{debug, warn};

use crate::membership::Configuration;
use crate::storage::{StorageError, StorageResult};

/// Maximum snapshot data size (256 MB).
pub const SNAPSHOT_SIZE_MAX: u64 = 256 * 1024 * 1024;

/// Snapshot magic bytes for validation.
const SNAPSHOT_MAGIC: u32 = 0x5243_534E; // "RCSN"

/// Snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// File extension of stored snapshots.
const SNAPSHOT_EXTENSION: &str = "snap";

/// Metadata describing what a snapshot covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Last log index included in the snapshot.
    pub last_included_index: LogIndex,
    /// Term of the last log entry included.
    pub last_included_term: TermId,
    /// Latest configuration at or before `last_included_index`.
    pub configuration: Configuration,
    /// Index of the entry that carried `configuration`.
    pub configuration_index: LogIndex,
}

/// A point-in-time image of the replicated state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// What the snapshot covers.
    pub meta: SnapshotMeta,
    /// State machine image.
    pub data: Bytes,
    /// CRC32 checksum of `data`.
    pub checksum: u32,
}

impl Snapshot {
    /// Creates a new snapshot, computing its checksum.
    ///
    /// # Panics
    ///
    /// Panics if data exceeds `SNAPSHOT_SIZE_MAX`.
    #[must_use]
    pub fn new(meta: SnapshotMeta, data: Bytes) -> Self {
        assert!(
            data.len() as u64 <= SNAPSHOT_SIZE_MAX,
            "snapshot data exceeds maximum size: {} > {}",
            data.len(),
            SNAPSHOT_SIZE_MAX
        );

        let checksum = crc32fast::hash(&data);
        Self {
            meta,
            data,
            checksum,
        }
    }

    /// Returns the last log index covered.
    #[must_use]
    pub const fn last_included_index(&self) -> LogIndex {
        self.meta.last_included_index
    }

    /// Returns the term of the last log index covered.
    #[must_use]
    pub const fn last_included_term(&self) -> TermId {
        self.meta.last_included_term
    }

    /// Verifies the data checksum.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }

    /// Encodes the snapshot to bytes.
    ///
    /// Format:
    /// - magic (4 bytes): "RCSN"
    /// - version (4 bytes)
    /// - `last_included_index` (8 bytes), `last_included_term` (8 bytes)
    /// - `configuration_index` (8 bytes), configuration (variable)
    /// - `data_len` (8 bytes), checksum (4 bytes), data (variable)
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.data.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Appends the encoded snapshot to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(SNAPSHOT_MAGIC);
        buf.put_u32_le(SNAPSHOT_VERSION);
        buf.put_u64_le(self.meta.last_included_index.get());
        buf.put_u64_le(self.meta.last_included_term.get());
        buf.put_u64_le(self.meta.configuration_index.get());
        self.meta.configuration.encode_into(buf);
        buf.put_u64_le(self.data.len() as u64);
        buf.put_u32_le(self.checksum);
        buf.extend_from_slice(&self.data);
    }

    /// Decodes a snapshot that fills the whole buffer.
    ///
    /// Returns `None` if the data is invalid or corrupted.
    #[must_use]
    pub fn decode(mut data: Bytes) -> Option<Self> {
        let snapshot = Self::decode_from(&mut data)?;
        data.is_empty().then_some(snapshot)
    }

    /// Decodes a snapshot from the front of `data`, advancing past it.
    ///
    /// Returns `None` if the data is invalid or corrupted.
    pub fn decode_from(data: &mut Bytes) -> Option<Self> {
        if data.remaining() < 32 {
            return None;
        }
        if data.get_u32_le() != SNAPSHOT_MAGIC {
            return None;
        }
        if data.get_u32_le() != SNAPSHOT_VERSION {
            return None;
        }

        let last_included_index = LogIndex::new(data.get_u64_le());
        let last_included_term = TermId::new(data.get_u64_le());
        let configuration_index = LogIndex::new(data.get_u64_le());
        let configuration = Configuration::decode_from(data)?;

        if data.remaining() < 12 {
            return None;
        }
        let data_len = data.get_u64_le();
        let checksum = data.get_u32_le();
        if data_len > SNAPSHOT_SIZE_MAX || (data.remaining() as u64) < data_len {
            return None;
        }

        // Safe cast: data_len is bounded by SNAPSHOT_SIZE_MAX which fits in usize.
        #[allow(clippy::cast_possible_truncation)]
        let payload = data.split_to(data_len as usize);
        if crc32fast::hash(&payload) != checksum {
            return None;
        }

        Some(Self {
            meta: SnapshotMeta {
                last_included_index,
                last_included_term,
                configuration,
                configuration_index,
            },
            data: payload,
            checksum,
        })
    }
}

/// Directory of snapshot files, newest kept.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    /// Opens (creating if needed) a snapshot directory.
    ///
    /// # Errors
    /// Returns an I/O error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>, retain: usize) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io("create snapshot dir", &e))?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    /// Returns the snapshot directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably writes a snapshot and prunes older ones.
    ///
    /// # Errors
    /// Returns an I/O error if the snapshot cannot be written.
    pub fn save(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let name = format!(
            "{}-{}.{SNAPSHOT_EXTENSION}",
            snapshot.last_included_term().get(),
            snapshot.last_included_index().get()
        );
        let path = self.dir.join(&name);
        let temp_path = self.dir.join(format!("{name}.tmp"));

        let encoded = snapshot.encode();
        {
            let mut file =
                File::create(&temp_path).map_err(|e| StorageError::io("create snapshot", &e))?;
            file.write_all(&encoded)
                .map_err(|e| StorageError::io("write snapshot", &e))?;
            file.sync_all()
                .map_err(|e| StorageError::io("sync snapshot", &e))?;
        }
        fs::rename(&temp_path, &path).map_err(|e| StorageError::io("rename snapshot", &e))?;
        sync_dir(&self.dir);

        debug!(
            index = snapshot.last_included_index().get(),
            term = snapshot.last_included_term().get(),
            bytes = encoded.len(),
            "Saved snapshot"
        );

        self.prune()
    }

    /// Loads the newest readable snapshot.
    ///
    /// Corrupt files are skipped with a warning.
    ///
    /// # Errors
    /// Returns an I/O error if the directory cannot be listed.
    pub fn latest(&self) -> StorageResult<Option<Snapshot>> {
        for (_, _, path) in self.list()? {
            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read snapshot");
                    continue;
                }
            };
            match Snapshot::decode(Bytes::from(raw)) {
                Some(snapshot) => return Ok(Some(snapshot)),
                None => warn!(path = %path.display(), "Skipping corrupt snapshot"),
            }
        }
        Ok(None)
    }

    /// Lists snapshot files as (index, term, path), newest first.
    fn list(&self) -> StorageResult<Vec<(u64, u64, PathBuf)>> {
        let mut found = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| StorageError::io("list snapshots", &e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("list snapshots", &e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((term, index)) = stem.split_once('-') else {
                continue;
            };
            if let (Ok(term), Ok(index)) = (term.parse::<u64>(), index.parse::<u64>()) {
                found.push((index, term, path));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(found)
    }

    fn prune(&self) -> StorageResult<()> {
        for (index, term, path) in self.list()?.into_iter().skip(self.retain) {
            if let Err(e) = fs::remove_file(&path) {
                warn!(index, term, error = %e, "Failed to remove old snapshot");
            }
        }
        Ok(())
    }
}

/// Best-effort fsync of a directory so renames survive a crash.
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
