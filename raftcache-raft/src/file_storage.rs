//! Durable file-backed Raft storage.
//!
//! Layout under the data directory:
//!
//! ```text
//! raft.meta              term and vote, replaced atomically on every change
//! raft.log               entries after the latest snapshot, append-only
//! snapshots/<t>-<i>.snap newest snapshots, see `SnapshotStore`
//! ```
//!
//! Log record format:
//!
//! ```text
//! [crc32: 4][len: 4][term: 8][index: 8][kind: 1][data: len - 17]
//! ```
//!
//! The checksum covers `len` through the end of `data`. A record that fails
//! its checksum or is cut short marks the torn tail of an interrupted write;
//! it and everything after it are truncated on open.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use raftcache_core::{LogIndex, TermId};
use tracing::{debug, info, warn};

use crate::log::{EntryKind, LogEntry};
use crate::snapshot::{sync_dir, Snapshot, SnapshotStore};
use crate::storage::{PersistentState, RaftStorage, StorageError, StorageResult};

/// Magic bytes for the metadata file.
const META_MAGIC: u32 = 0x5243_4D54; // "RCMT"

/// Current version of the metadata format.
const META_VERSION: u32 = 1;

/// Bytes before the record body: crc + len.
const RECORD_HEADER_SIZE: usize = 8;

/// Bytes of fixed fields in the record body: term + index + kind.
const RECORD_FIXED_SIZE: usize = 17;

const META_FILE: &str = "raft.meta";
const LOG_FILE: &str = "raft.log";
const SNAPSHOT_DIR: &str = "snapshots";

/// File-backed `RaftStorage`.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    log: File,
    /// Valid length of `raft.log`.
    log_len: u64,
    /// Index and byte offset of every record in `raft.log`.
    offsets: Vec<(LogIndex, u64)>,
    state: Option<PersistentState>,
    snapshots: SnapshotStore,
    snapshot: Option<Snapshot>,
}

impl FileStorage {
    /// Opens storage in `dir`, creating it if needed and repairing a torn
    /// log tail.
    ///
    /// # Errors
    /// Returns an error if files cannot be opened or the metadata is corrupt.
    pub fn open(dir: impl Into<PathBuf>, snapshot_retain: usize) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io("create data dir", &e))?;

        let state = read_meta(&dir.join(META_FILE))?;
        let snapshots = SnapshotStore::open(dir.join(SNAPSHOT_DIR), snapshot_retain)?;
        let snapshot = snapshots.latest()?;

        let log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOG_FILE))
            .map_err(|e| StorageError::io("open log", &e))?;

        let mut storage = Self {
            dir,
            log,
            log_len: 0,
            offsets: Vec::new(),
            state,
            snapshots,
            snapshot,
        };
        storage.recover_log()?;

        info!(
            dir = %storage.dir.display(),
            term = storage.state.as_ref().map_or(0, |s| s.current_term.get()),
            entries = storage.offsets.len(),
            snapshot_index = storage.snapshot_index().get(),
            "Opened raft storage"
        );
        Ok(storage)
    }

    /// Returns the data directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_index(&self) -> LogIndex {
        self.snapshot
            .as_ref()
            .map_or(LogIndex::new(0), Snapshot::last_included_index)
    }

    fn read_log(&mut self) -> StorageResult<Vec<u8>> {
        let mut raw = Vec::new();
        self.log
            .seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::io("seek log", &e))?;
        self.log
            .read_to_end(&mut raw)
            .map_err(|e| StorageError::io("read log", &e))?;
        Ok(raw)
    }

    /// Scans the log, truncating a torn tail and dropping entries covered by
    /// the snapshot.
    fn recover_log(&mut self) -> StorageResult<()> {
        let raw = self.read_log()?;
        let (entries, valid_len) = parse_records(&raw);

        if (valid_len as usize) < raw.len() {
            warn!(
                valid_bytes = valid_len,
                file_bytes = raw.len(),
                "Truncating torn tail of raft log"
            );
            self.log
                .set_len(valid_len)
                .map_err(|e| StorageError::io("truncate log", &e))?;
            self.log
                .sync_all()
                .map_err(|e| StorageError::io("sync log", &e))?;
        }

        let snapshot_index = self.snapshot_index();
        if entries.iter().any(|(e, _)| e.index <= snapshot_index) {
            // A crash interrupted compaction after the snapshot was saved.
            let kept: Vec<LogEntry> = entries
                .into_iter()
                .map(|(e, _)| e)
                .filter(|e| e.index > snapshot_index)
                .collect();
            return self.rewrite(&kept);
        }

        self.offsets = entries.iter().map(|(e, off)| (e.index, *off)).collect();
        self.log_len = valid_len;
        Ok(())
    }

    /// Atomically replaces the log with `entries`.
    fn rewrite(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        let path = self.dir.join(LOG_FILE);
        let temp_path = self.dir.join(format!("{LOG_FILE}.tmp"));

        let mut buf = BytesMut::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            offsets.push((entry.index, buf.len() as u64));
            encode_record(entry, &mut buf);
        }

        {
            let mut file =
                File::create(&temp_path).map_err(|e| StorageError::io("create log", &e))?;
            file.write_all(&buf)
                .map_err(|e| StorageError::io("write log", &e))?;
            file.sync_all()
                .map_err(|e| StorageError::io("sync log", &e))?;
        }
        fs::rename(&temp_path, &path).map_err(|e| StorageError::io("rename log", &e))?;
        sync_dir(&self.dir);

        self.log = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StorageError::io("open log", &e))?;
        self.log_len = buf.len() as u64;
        self.offsets = offsets;

        debug!(entries = entries.len(), "Rewrote raft log");
        Ok(())
    }
}

impl RaftStorage for FileStorage {
    fn save_state(&mut self, state: &PersistentState) -> StorageResult<()> {
        write_meta(&self.dir, state)?;
        self.state = Some(state.clone());
        Ok(())
    }

    fn load_state(&self) -> StorageResult<Option<PersistentState>> {
        Ok(self.state.clone())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut expected = self
            .offsets
            .last()
            .map_or_else(|| self.snapshot_index(), |(idx, _)| *idx)
            .next();
        let mut buf = BytesMut::new();
        let mut new_offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.index != expected {
                return Err(StorageError::Corruption {
                    message: format!(
                        "non-sequential entry: expected {}, got {}",
                        expected.get(),
                        entry.index.get()
                    ),
                });
            }
            new_offsets.push((entry.index, self.log_len + buf.len() as u64));
            encode_record(entry, &mut buf);
            expected = expected.next();
        }

        self.log
            .seek(SeekFrom::Start(self.log_len))
            .map_err(|e| StorageError::io("seek log", &e))?;
        self.log
            .write_all(&buf)
            .map_err(|e| StorageError::io("append log", &e))?;
        self.log
            .sync_data()
            .map_err(|e| StorageError::io("sync log", &e))?;

        self.log_len += buf.len() as u64;
        self.offsets.extend(new_offsets);
        Ok(())
    }

    fn truncate_after(&mut self, last_to_keep: LogIndex) -> StorageResult<()> {
        let keep = self.offsets.partition_point(|(idx, _)| *idx <= last_to_keep);
        let Some(&(_, cut)) = self.offsets.get(keep) else {
            return Ok(());
        };

        self.log
            .set_len(cut)
            .map_err(|e| StorageError::io("truncate log", &e))?;
        self.log
            .sync_all()
            .map_err(|e| StorageError::io("sync log", &e))?;
        self.log_len = cut;
        self.offsets.truncate(keep);
        Ok(())
    }

    fn load_entries(&self) -> StorageResult<Vec<LogEntry>> {
        let mut raw = Vec::new();
        let mut file = &self.log;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::io("seek log", &e))?;
        file.read_to_end(&mut raw)
            .map_err(|e| StorageError::io("read log", &e))?;

        // Safe cast: log_len never exceeds the bytes just read.
        #[allow(clippy::cast_possible_truncation)]
        raw.truncate(self.log_len as usize);
        let (entries, valid_len) = parse_records(&raw);
        if valid_len != self.log_len {
            return Err(StorageError::Corruption {
                message: format!(
                    "raft log changed underneath storage: {} valid of {} bytes",
                    valid_len, self.log_len
                ),
            });
        }
        Ok(entries.into_iter().map(|(e, _)| e).collect())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> StorageResult<()> {
        self.snapshots.save(snapshot)?;
        self.snapshot = Some(snapshot.clone());

        let index = snapshot.last_included_index();
        let kept: Vec<LogEntry> = self
            .load_entries()?
            .into_iter()
            .filter(|e| e.index > index)
            .collect();
        self.rewrite(&kept)
    }

    fn load_snapshot(&self) -> StorageResult<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }
}

fn encode_record(entry: &LogEntry, buf: &mut BytesMut) {
    let start = buf.len();
    // Safe cast: entry data is bounded by the frame limit, far below u32::MAX.
    #[allow(clippy::cast_possible_truncation)]
    let body_len = (RECORD_FIXED_SIZE + entry.data.len()) as u32;

    buf.put_u32_le(0); // Checksum placeholder.
    buf.put_u32_le(body_len);
    buf.put_u64_le(entry.term.get());
    buf.put_u64_le(entry.index.get());
    buf.put_u8(entry.kind.to_u8());
    buf.put_slice(&entry.data);

    let checksum = crc32fast::hash(&buf[start + 4..]);
    buf[start..start + 4].copy_from_slice(&checksum.to_le_bytes());
}

/// Parses records until the end or the first invalid one.
///
/// Returns the entries with their offsets and the length of the valid prefix.
fn parse_records(raw: &[u8]) -> (Vec<(LogEntry, u64)>, u64) {
    let mut entries: Vec<(LogEntry, u64)> = Vec::new();
    let mut offset = 0usize;

    while raw.len() - offset >= RECORD_HEADER_SIZE {
        let mut header = &raw[offset..offset + RECORD_HEADER_SIZE];
        let checksum = header.get_u32_le();
        let body_len = header.get_u32_le() as usize;
        if body_len < RECORD_FIXED_SIZE {
            break;
        }
        let end = offset + RECORD_HEADER_SIZE + body_len;
        if end > raw.len() {
            break;
        }
        if crc32fast::hash(&raw[offset + 4..end]) != checksum {
            break;
        }

        let mut body = &raw[offset + RECORD_HEADER_SIZE..end];
        let term = TermId::new(body.get_u64_le());
        let index = LogIndex::new(body.get_u64_le());
        let Some(kind) = EntryKind::from_u8(body.get_u8()) else {
            break;
        };
        if let Some((prev, _)) = entries.last() {
            if index != prev.index.next() {
                break;
            }
        }

        entries.push((
            LogEntry::with_kind(term, index, kind, Bytes::copy_from_slice(body)),
            offset as u64,
        ));
        offset = end;
    }

    (entries, offset as u64)
}

fn read_meta(path: &Path) -> StorageResult<Option<PersistentState>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io("read meta", &e)),
    };

    if raw.len() < 12 {
        return Err(StorageError::Corruption {
            message: format!("meta file too short: {} bytes", raw.len()),
        });
    }
    let (payload, tail) = raw.split_at(raw.len() - 4);
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let expected = crc32fast::hash(payload);
    if stored != expected {
        return Err(StorageError::Corruption {
            message: format!("meta checksum mismatch: expected {expected:#x}, got {stored:#x}"),
        });
    }

    let mut buf = payload;
    if buf.get_u32_le() != META_MAGIC {
        return Err(StorageError::Corruption {
            message: "meta file has bad magic".to_string(),
        });
    }
    let version = buf.get_u32_le();
    if version != META_VERSION {
        return Err(StorageError::Corruption {
            message: format!("unsupported meta version {version}"),
        });
    }
    PersistentState::decode(&mut buf)
        .map(Some)
        .ok_or_else(|| StorageError::Corruption {
            message: "meta file has malformed state".to_string(),
        })
}

fn write_meta(dir: &Path, state: &PersistentState) -> StorageResult<()> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32_le(META_MAGIC);
    buf.put_u32_le(META_VERSION);
    state.encode(&mut buf);
    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);

    let path = dir.join(META_FILE);
    let temp_path = dir.join(format!("{META_FILE}.tmp"));
    {
        let mut file = File::create(&temp_path).map_err(|e| StorageError::io("create meta", &e))?;
        file.write_all(&buf)
            .map_err(|e| StorageError::io("write meta", &e))?;
        file.sync_all()
            .map_err(|e| StorageError::io("sync meta", &e))?;
    }
    fs::rename(&temp_path, &path).map_err(|e| StorageError::io("rename meta", &e))?;
    sync_dir(dir);
    Ok(())
}
