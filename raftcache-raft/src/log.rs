//! Raft log entries and the in-memory log.
//!
//! The log may be compacted: entries up to `snapshot_index` are discarded and
//! represented only by the snapshot's last included index and term.

use bytes::Bytes;
use raftcache_core::{LogIndex, TermId};

use crate::membership::Configuration;

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// An opaque command for the replicated state machine.
    Command,
    /// An encoded `Configuration`.
    Configuration,
    /// An empty entry appended by a new leader to commit earlier terms.
    Noop,
}

impl EntryKind {
    /// Returns the wire tag for this kind.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Command => 0,
            Self::Configuration => 1,
            Self::Noop => 2,
        }
    }

    /// Parses a wire tag.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Command),
            1 => Some(Self::Configuration),
            2 => Some(Self::Noop),
            _ => None,
        }
    }
}

/// Encoded size of an entry's fixed fields: term, index, kind and the
/// payload length.
pub const ENTRY_HEADER_BYTES: usize = 21;

/// A single entry in the Raft log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// The term when this entry was created.
    pub term: TermId,
    /// The log index of this entry.
    pub index: LogIndex,
    /// What the payload means.
    pub kind: EntryKind,
    /// The payload.
    pub data: Bytes,
}

impl LogEntry {
    /// Creates a command entry.
    #[must_use]
    pub const fn new(term: TermId, index: LogIndex, data: Bytes) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Command,
            data,
        }
    }

    /// Creates an entry of the given kind.
    #[must_use]
    pub const fn with_kind(term: TermId, index: LogIndex, kind: EntryKind, data: Bytes) -> Self {
        Self {
            term,
            index,
            kind,
            data,
        }
    }

    /// Creates a no-op entry.
    #[must_use]
    pub const fn noop(term: TermId, index: LogIndex) -> Self {
        Self::with_kind(term, index, EntryKind::Noop, Bytes::new())
    }

    /// Creates a configuration entry.
    #[must_use]
    pub fn configuration(term: TermId, index: LogIndex, config: &Configuration) -> Self {
        Self::with_kind(term, index, EntryKind::Configuration, config.encode())
    }

    /// Returns the size of this entry on the wire.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_BYTES + self.data.len()
    }

    /// Decodes the configuration carried by a configuration entry.
    ///
    /// Returns `None` for other kinds or malformed payloads.
    #[must_use]
    pub fn decode_configuration(&self) -> Option<Configuration> {
        if self.kind != EntryKind::Configuration {
            return None;
        }
        Configuration::decode(&self.data)
    }
}

/// In-memory view of the Raft log after the latest snapshot.
#[derive(Debug, Default)]
pub struct RaftLog {
    /// Entries after the snapshot, in index order.
    entries: Vec<LogEntry>,
    /// Last index covered by the snapshot (0 if none).
    snapshot_index: LogIndex,
    /// Term of `snapshot_index` (0 if none).
    snapshot_term: TermId,
}

impl RaftLog {
    /// Creates a new empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            snapshot_index: LogIndex::new(0),
            snapshot_term: TermId::new(0),
        }
    }

    /// Creates an empty log whose prefix is covered by a snapshot.
    #[must_use]
    pub const fn with_snapshot(index: LogIndex, term: TermId) -> Self {
        Self {
            entries: Vec::new(),
            snapshot_index: index,
            snapshot_term: term,
        }
    }

    /// Returns true if no entries follow the snapshot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of entries held in memory.
    #[must_use]
    pub fn len(&self) -> u64 {
        // Safe cast: entries.len() is bounded by system memory which always fits in u64.
        #[allow(clippy::cast_possible_truncation)]
        let len = self.entries.len() as u64;
        len
    }

    /// Returns the last index covered by the snapshot.
    #[must_use]
    pub const fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    /// Returns the term of the last index covered by the snapshot.
    #[must_use]
    pub const fn snapshot_term(&self) -> TermId {
        self.snapshot_term
    }

    /// Returns the first index that may be held in memory.
    #[must_use]
    pub const fn first_index(&self) -> LogIndex {
        self.snapshot_index.next()
    }

    /// Returns the last log index, or the snapshot index if no entries follow.
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        LogIndex::new(self.snapshot_index.get() + self.len())
    }

    /// Returns the term of the last entry, or the snapshot term.
    #[must_use]
    pub fn last_term(&self) -> TermId {
        self.entries.last().map_or(self.snapshot_term, |e| e.term)
    }

    /// Gets an entry by index.
    #[must_use]
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        // Safe cast: the offset is bounded by entries.len() which fits in usize.
        #[allow(clippy::cast_possible_truncation)]
        let offset = (index.get() - self.snapshot_index.get() - 1) as usize;
        self.entries.get(offset)
    }

    /// Returns the term at a given index.
    ///
    /// Index 0 has term 0. The snapshot index has the snapshot term. Indexes
    /// that were compacted away or are beyond the log return `None`.
    #[must_use]
    pub fn term_at(&self, index: LogIndex) -> Option<TermId> {
        if index.get() == 0 {
            return Some(TermId::new(0));
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Appends an entry to the log.
    ///
    /// # Panics
    /// Panics if the entry index is not sequential.
    pub fn append(&mut self, entry: LogEntry) {
        let expected_index = self.last_index().next();
        assert_eq!(
            entry.index, expected_index,
            "log entry index must be sequential: expected {}, got {}",
            expected_index.get(),
            entry.index.get()
        );
        self.entries.push(entry);
    }

    /// Finds where a batch from the leader diverges from this log.
    ///
    /// Returns the position in `entries` of the first entry not already
    /// present, and the index from which the local log must be truncated if
    /// an existing entry conflicts (same index, different term). Entries
    /// covered by the snapshot are treated as present.
    #[must_use]
    pub fn find_conflict(&self, entries: &[LogEntry]) -> (usize, Option<LogIndex>) {
        for (position, entry) in entries.iter().enumerate() {
            if entry.index <= self.snapshot_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => return (position, Some(entry.index)),
                None => return (position, None),
            }
        }
        (entries.len(), None)
    }

    /// Truncates the log after the given index.
    ///
    /// Keeps entries up to and including `last_to_keep`.
    pub fn truncate_after(&mut self, last_to_keep: LogIndex) {
        // Precondition: compacted entries are committed and never truncated.
        debug_assert!(last_to_keep >= self.snapshot_index);

        // Safe cast: keep_count is bounded by entries.len() which fits in usize.
        #[allow(clippy::cast_possible_truncation)]
        let keep_count = last_to_keep.get().saturating_sub(self.snapshot_index.get()) as usize;
        if keep_count < self.entries.len() {
            self.entries.truncate(keep_count);
        }
    }

    /// Returns entries starting at `start_index`, at most `max_entries` of
    /// them and at most `max_bytes` of encoded size.
    ///
    /// The first entry is returned even if it alone exceeds `max_bytes`, so
    /// replication always makes progress.
    #[must_use]
    pub fn entries_from(
        &self,
        start_index: LogIndex,
        max_entries: usize,
        max_bytes: usize,
    ) -> Vec<LogEntry> {
        if start_index > self.last_index() {
            return Vec::new();
        }

        // Precondition: callers switch to snapshots for compacted ranges.
        debug_assert!(start_index > self.snapshot_index);

        // Safe cast: start is bounded by entries.len() which fits in usize.
        #[allow(clippy::cast_possible_truncation)]
        let start = start_index.get().saturating_sub(self.first_index().get()) as usize;
        let end = self.entries.len().min(start.saturating_add(max_entries));

        let mut bytes = 0_usize;
        let mut batch = Vec::new();
        for entry in &self.entries[start..end] {
            bytes = bytes.saturating_add(entry.encoded_len());
            if bytes > max_bytes && !batch.is_empty() {
                break;
            }
            batch.push(entry.clone());
        }
        batch
    }

    /// Returns all entries held in memory.
    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Discards entries up to and including `index`, recording `term` as the
    /// snapshot term. Entries after `index` are kept.
    pub fn compact_to(&mut self, index: LogIndex, term: TermId) {
        if index <= self.snapshot_index {
            return;
        }

        if index >= self.last_index() {
            self.entries.clear();
        } else {
            // Safe cast: drain count is bounded by entries.len() which fits in usize.
            #[allow(clippy::cast_possible_truncation)]
            let drain = (index.get() - self.snapshot_index.get()) as usize;
            self.entries.drain(..drain);
        }
        self.snapshot_index = index;
        self.snapshot_term = term;

        // Postcondition: the first remaining entry directly follows the snapshot.
        debug_assert!(self
            .entries
            .first()
            .map_or(true, |e| e.index == index.next()));
    }

    /// Checks if our log is at least as up-to-date as (`last_term`, `last_index`).
    ///
    /// Used in leader election to determine if we should grant a vote.
    #[must_use]
    pub fn is_up_to_date(&self, other_term: TermId, other_index: LogIndex) -> bool {
        let my_term = self.last_term();
        let my_index = self.last_index();

        // The candidate is up to date if its last term is newer, or equal
        // with a log at least as long as ours.
        other_term > my_term || (other_term == my_term && other_index >= my_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(
            TermId::new(term),
            LogIndex::new(index),
            Bytes::from(format!("entry-{index}")),
        )
    }

    fn log_with(terms: &[u64]) -> RaftLog {
        let mut log = RaftLog::new();
        for (i, &term) in terms.iter().enumerate() {
            log.append(make_entry(term, i as u64 + 1));
        }
        log
    }

    #[test]
    fn test_empty_log() {
        let log = RaftLog::new();

        assert!(log.is_empty());
        assert_eq!(log.first_index().get(), 1);
        assert_eq!(log.last_index().get(), 0);
        assert_eq!(log.last_term().get(), 0);
        assert_eq!(log.term_at(LogIndex::new(0)), Some(TermId::new(0)));
        assert!(log.get(LogIndex::new(1)).is_none());
    }

    #[test]
    fn test_append_and_get() {
        let log = log_with(&[1, 1, 2]);

        assert_eq!(log.len(), 3);
        assert_eq!(log.last_index().get(), 3);
        assert_eq!(log.last_term().get(), 2);
        assert_eq!(log.get(LogIndex::new(2)).unwrap().term.get(), 1);
        assert!(log.get(LogIndex::new(4)).is_none());
        assert!(log.term_at(LogIndex::new(4)).is_none());
    }

    #[test]
    #[should_panic(expected = "log entry index must be sequential")]
    fn test_append_gap_panics() {
        let mut log = log_with(&[1]);
        log.append(make_entry(1, 3));
    }

    #[test]
    fn test_truncate() {
        let mut log = log_with(&[1, 1, 2]);
        log.truncate_after(LogIndex::new(1));

        assert_eq!(log.len(), 1);
        assert_eq!(log.last_index().get(), 1);
    }

    #[test]
    fn test_find_conflict() {
        let log = log_with(&[1, 1, 1]);

        // Identical prefix, one new entry.
        let batch = vec![make_entry(1, 2), make_entry(1, 3), make_entry(2, 4)];
        assert_eq!(log.find_conflict(&batch), (2, None));

        // Conflict at index 2.
        let batch = vec![make_entry(2, 2), make_entry(2, 3)];
        assert_eq!(log.find_conflict(&batch), (0, Some(LogIndex::new(2))));

        // Nothing new.
        let batch = vec![make_entry(1, 1)];
        assert_eq!(log.find_conflict(&batch), (1, None));
    }

    #[test]
    fn test_compaction_keeps_suffix() {
        let mut log = log_with(&[1, 1, 2, 2, 3]);
        log.compact_to(LogIndex::new(3), TermId::new(2));

        assert_eq!(log.snapshot_index().get(), 3);
        assert_eq!(log.first_index().get(), 4);
        assert_eq!(log.last_index().get(), 5);
        assert_eq!(log.term_at(LogIndex::new(3)), Some(TermId::new(2)));
        assert!(log.term_at(LogIndex::new(2)).is_none());
        assert!(log.get(LogIndex::new(3)).is_none());
        assert_eq!(log.get(LogIndex::new(4)).unwrap().term.get(), 2);

        let entries = log.entries_from(LogIndex::new(4), 10, usize::MAX);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index.get(), 4);
    }

    #[test]
    fn test_compaction_past_end_clears_log() {
        let mut log = log_with(&[1, 1]);
        log.compact_to(LogIndex::new(10), TermId::new(4));

        assert!(log.is_empty());
        assert_eq!(log.last_index().get(), 10);
        assert_eq!(log.last_term().get(), 4);
        log.append(make_entry(4, 11));
        assert_eq!(log.last_index().get(), 11);
    }

    #[test]
    fn test_entries_from_respects_max() {
        let log = log_with(&[1, 1, 1, 1]);
        let entries = log.entries_from(LogIndex::new(2), 2, usize::MAX);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].index.get(), 3);
        assert!(log.entries_from(LogIndex::new(5), 2, usize::MAX).is_empty());
    }

    #[test]
    fn test_entries_from_respects_byte_budget() {
        let mut log = RaftLog::new();
        for index in 1..=6 {
            let data = Bytes::from(vec![0_u8; 1000]);
            log.append(LogEntry::new(TermId::new(1), LogIndex::new(index), data));
        }
        let entry_len = log.get(LogIndex::new(1)).unwrap().encoded_len();

        let entries = log.entries_from(LogIndex::new(1), 100, 3 * entry_len);
        assert_eq!(entries.len(), 3);
        let entries = log.entries_from(LogIndex::new(1), 100, 3 * entry_len - 1);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].index.get(), 2);
    }

    #[test]
    fn test_entries_from_sends_one_oversized_entry() {
        let mut log = RaftLog::new();
        log.append(LogEntry::new(
            TermId::new(1),
            LogIndex::new(1),
            Bytes::from(vec![7_u8; 4096]),
        ));
        log.append(make_entry(1, 2));

        let entries = log.entries_from(LogIndex::new(1), 100, 1024);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data.len(), 4096);
    }

    #[test]
    fn test_is_up_to_date() {
        let log = log_with(&[1, 2]);

        // Our log: term=2, index=2.
        assert!(log.is_up_to_date(TermId::new(3), LogIndex::new(1)));
        assert!(log.is_up_to_date(TermId::new(2), LogIndex::new(2)));
        assert!(log.is_up_to_date(TermId::new(2), LogIndex::new(3)));
        assert!(!log.is_up_to_date(TermId::new(2), LogIndex::new(1)));
        assert!(!log.is_up_to_date(TermId::new(1), LogIndex::new(5)));
    }

    #[test]
    fn test_configuration_entry_round_trip() {
        use crate::membership::ServerDescriptor;
        use raftcache_core::ServerId;

        let config = Configuration::new(vec![ServerDescriptor::voter(
            ServerId::new("a").unwrap(),
            "x:1",
        )])
        .unwrap();
        let entry = LogEntry::configuration(TermId::new(1), LogIndex::new(1), &config);
        assert_eq!(entry.decode_configuration(), Some(config));
        assert!(LogEntry::noop(TermId::new(1), LogIndex::new(2))
            .decode_configuration()
            .is_none());
    }
}
