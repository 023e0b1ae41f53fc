//! # log_store
//!
//! why: the durable log contract and the rules every implementation shares
//! relations: implemented here in memory and by wal.rs on disk; owned by raft-node's driver
//! what: LogStorage trait, PersistedLog model, InMemoryLogStore

use crate::error::{Result, StorageError};
use parking_lot::Mutex;
use raft_core::{HardState, LogEntry, SnapshotMetadata};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// durable storage of log entries and hard state
pub trait LogStorage: Send {
    /// persist entries and hard state together; a crash leaves neither or both
    fn append(&mut self, entries: &[LogEntry], hard_state: Option<&HardState>) -> Result<()>;

    /// entries in `[lo, hi)`
    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<LogEntry>>;

    /// discard entries at or below `through`
    fn compact(&mut self, through: u64) -> Result<()>;

    /// mark that a snapshot now covers the log through `metadata.index`
    fn record_snapshot(&mut self, metadata: &SnapshotMetadata) -> Result<()>;

    /// everything needed to restart the consensus engine
    fn load(&self) -> Result<PersistedLog>;

    fn last_index(&self) -> u64;
}

/// the retained log as it stands after all completed operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedLog {
    pub hard_state: HardState,
    /// index and term of the last discarded entry
    pub base_index: u64,
    pub base_term: u64,
    pub entries: Vec<LogEntry>,
    /// newest snapshot the log has been told about
    pub snapshot: Option<SnapshotMetadata>,
}

impl PersistedLog {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.snapshot.is_none() && self.hard_state == HardState::default()
    }

    pub fn first_index(&self) -> u64 {
        self.base_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.base_index + self.entries.len() as u64
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, |s| s.index)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.base_index {
            return Some(self.base_term);
        }
        if index < self.base_index || index > self.last_index() {
            return None;
        }
        Some(self.entries[(index - self.base_index - 1) as usize].term)
    }

    pub(crate) fn check_append(&self, entries: &[LogEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        if first.index <= self.base_index {
            return Err(StorageError::Compacted { index: first.index });
        }
        if first.index > self.last_index() + 1 {
            return Err(StorageError::Gap { expected: self.last_index() + 1, found: first.index });
        }
        for pair in entries.windows(2) {
            if pair[1].index != pair[0].index + 1 {
                return Err(StorageError::Gap { expected: pair[0].index + 1, found: pair[1].index });
            }
        }
        Ok(())
    }

    pub(crate) fn apply_append(&mut self, entries: &[LogEntry], hard_state: Option<&HardState>) {
        if let Some(first) = entries.first() {
            self.entries.truncate((first.index - self.base_index - 1) as usize);
            self.entries.extend_from_slice(entries);
        }
        if let Some(hs) = hard_state {
            self.hard_state = *hs;
        }
    }

    pub(crate) fn append(&mut self, entries: &[LogEntry], hard_state: Option<&HardState>) -> Result<()> {
        self.check_append(entries)?;
        self.apply_append(entries, hard_state);
        Ok(())
    }

    pub(crate) fn entries(&self, lo: u64, hi: u64) -> Result<Vec<LogEntry>> {
        if lo <= self.base_index {
            return Err(StorageError::Compacted { index: lo });
        }
        if hi > self.last_index() + 1 {
            return Err(StorageError::Unavailable { index: hi - 1 });
        }
        if lo >= hi {
            return Ok(Vec::new());
        }
        let start = (lo - self.base_index - 1) as usize;
        let end = (hi - self.base_index - 1) as usize;
        Ok(self.entries[start..end].to_vec())
    }

    /// whether compacting through `through` changes anything
    pub(crate) fn check_compact(&self, through: u64) -> Result<bool> {
        if through <= self.base_index {
            return Ok(false);
        }
        let snapshot = self.snapshot_index();
        if through > snapshot {
            return Err(StorageError::CompactBeyondSnapshot { through, snapshot });
        }
        if through > self.hard_state.commit {
            return Err(StorageError::CompactBeyondCommit { through, commit: self.hard_state.commit });
        }
        if through > self.last_index() {
            return Err(StorageError::Unavailable { index: through });
        }
        Ok(true)
    }

    pub(crate) fn apply_compact(&mut self, through: u64) {
        if let Some(term) = self.term_at(through) {
            self.entries.drain(..(through - self.base_index) as usize);
            self.base_index = through;
            self.base_term = term;
        }
    }

    pub(crate) fn compact(&mut self, through: u64) -> Result<()> {
        if self.check_compact(through)? {
            self.apply_compact(through);
        }
        Ok(())
    }

    pub(crate) fn check_snapshot(&self, metadata: &SnapshotMetadata) -> Result<()> {
        let latest = self.snapshot_index();
        if metadata.index < latest {
            return Err(StorageError::SnapshotOutOfOrder { index: metadata.index, latest });
        }
        Ok(())
    }

    pub(crate) fn apply_snapshot(&mut self, metadata: &SnapshotMetadata) {
        if self.term_at(metadata.index) != Some(metadata.term) {
            // the log disagrees with the snapshot; it is replaced wholesale
            self.entries.clear();
            self.base_index = metadata.index;
            self.base_term = metadata.term;
        }
        self.hard_state.commit = self.hard_state.commit.max(metadata.index);
        self.hard_state.term = self.hard_state.term.max(metadata.term);
        self.snapshot = Some(metadata.clone());
    }

    pub(crate) fn record_snapshot(&mut self, metadata: &SnapshotMetadata) -> Result<()> {
        self.check_snapshot(metadata)?;
        self.apply_snapshot(metadata);
        Ok(())
    }
}

// -- in-memory implementation --

/// log store kept in memory; clones share the same log
///
/// nothing survives the process, so tests use it where restart is not the point
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogStore {
    state: Arc<Mutex<PersistedLog>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStorage for InMemoryLogStore {
    fn append(&mut self, entries: &[LogEntry], hard_state: Option<&HardState>) -> Result<()> {
        self.state.lock().append(entries, hard_state)
    }

    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<LogEntry>> {
        self.state.lock().entries(lo, hi)
    }

    fn compact(&mut self, through: u64) -> Result<()> {
        self.state.lock().compact(through)
    }

    fn record_snapshot(&mut self, metadata: &SnapshotMetadata) -> Result<()> {
        self.state.lock().record_snapshot(metadata)
    }

    fn load(&self) -> Result<PersistedLog> {
        Ok(self.state.lock().clone())
    }

    fn last_index(&self) -> u64 {
        self.state.lock().last_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
        range.map(|i| LogEntry::new(term, i, vec![i as u8])).collect()
    }

    #[test]
    fn overlapping_append_replaces_suffix() {
        let mut log = PersistedLog::default();
        log.append(&entries(1..=3, 1), None).unwrap();
        log.append(&entries(2..=2, 2), None).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(2));
    }

    #[test]
    fn snapshot_with_matching_term_keeps_entries() {
        let mut log = PersistedLog::default();
        log.append(&entries(1..=5, 1), None).unwrap();
        log.record_snapshot(&SnapshotMetadata { index: 3, term: 1, ..Default::default() }).unwrap();
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.hard_state.commit, 3);
    }

    #[test]
    fn snapshot_with_other_term_resets_log() {
        let mut log = PersistedLog::default();
        log.append(&entries(1..=5, 1), None).unwrap();
        log.record_snapshot(&SnapshotMetadata { index: 8, term: 2, ..Default::default() }).unwrap();
        assert!(log.entries.is_empty());
        assert_eq!(log.first_index(), 9);
        assert_eq!(log.term_at(8), Some(2));
    }
}
