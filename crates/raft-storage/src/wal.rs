//! # wal
//!
//! why: keep the raft log durable across crashes using standard rust fs apis
//! relations: implements log_store::LogStorage; opened by raft-node at startup
//! what: FileLogStore, an fsync'd json-lines write-ahead log with atomic rewrites

use crate::error::{Result, StorageError};
use crate::log_store::{LogStorage, PersistedLog};
use raft_core::{HardState, LogEntry, SnapshotMetadata};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const WAL_FILE: &str = "wal.log";
const WAL_TEMP: &str = "wal.tmp";

/// one line of the wal
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WalRecord {
    Append { entries: Vec<LogEntry>, hard_state: Option<HardState> },
    Snapshot { metadata: SnapshotMetadata },
    /// full image written when the file is rewritten by compaction
    Base { state: PersistedLog },
}

/// file-backed log store
///
/// every operation is one json line followed by `sync_data`; a line cut short by
/// a crash is dropped on the next open. compaction writes the retained state to
/// a temp file and renames it over the wal.
pub struct FileLogStore {
    dir: PathBuf,
    file: File,
    state: PersistedLog,
}

impl FileLogStore {
    /// open or create the wal in `dir`, replaying whatever it holds
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(WAL_FILE);
        let existed = path.exists();
        let state = if existed { replay(&path)? } else { PersistedLog::default() };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !existed {
            sync_dir(&dir)?;
        }
        debug!(dir = %dir.display(), last_index = state.last_index(), "opened wal");
        Ok(Self { dir, file, state })
    }

    fn wal_path(&self) -> PathBuf {
        self.dir.join(WAL_FILE)
    }

    fn write_record(&mut self, record: &WalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// replace the wal with a single image of the current state
    fn rewrite(&mut self) -> Result<()> {
        let temp_path = self.dir.join(WAL_TEMP);
        let mut line = serde_json::to_vec(&WalRecord::Base { state: self.state.clone() })?;
        line.push(b'\n');

        // atomic write: write to temp file then rename
        let mut temp = File::create(&temp_path)?;
        temp.write_all(&line)?;
        temp.sync_all()?;
        fs::rename(&temp_path, self.wal_path())?;
        sync_dir(&self.dir)?;

        self.file = OpenOptions::new().append(true).open(self.wal_path())?;
        Ok(())
    }
}

/// make a rename or a newly created file in `dir` durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// rebuild the log from the wal, truncating a torn final line
fn replay(path: &Path) -> Result<PersistedLog> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;

    let mut state = PersistedLog::default();
    let mut offset = 0usize;
    while offset < raw.len() {
        let Some(len) = raw[offset..].iter().position(|b| *b == b'\n') else {
            // no newline: the final write never completed
            warn!(path = %path.display(), offset, "truncating torn wal tail");
            truncate(path, offset as u64)?;
            break;
        };
        let line = &raw[offset..offset + len];
        let next = offset + len + 1;
        match serde_json::from_slice::<WalRecord>(line) {
            Ok(record) => apply(&mut state, record)?,
            Err(e) if next >= raw.len() => {
                warn!(path = %path.display(), offset, error = %e, "truncating unreadable wal tail");
                truncate(path, offset as u64)?;
                break;
            }
            Err(e) => return Err(StorageError::corrupt(format!("wal record at byte {}", offset), e)),
        }
        offset = next;
    }
    Ok(state)
}

fn apply(state: &mut PersistedLog, record: WalRecord) -> Result<()> {
    let result = match record {
        WalRecord::Append { entries, hard_state } => state.append(&entries, hard_state.as_ref()),
        WalRecord::Snapshot { metadata } => state.record_snapshot(&metadata),
        WalRecord::Base { state: image } => {
            *state = image;
            Ok(())
        }
    };
    result.map_err(|e| StorageError::corrupt("wal replay", e))
}

fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

impl LogStorage for FileLogStore {
    fn append(&mut self, entries: &[LogEntry], hard_state: Option<&HardState>) -> Result<()> {
        if entries.is_empty() && hard_state.is_none() {
            return Ok(());
        }
        self.state.check_append(entries)?;
        self.write_record(&WalRecord::Append { entries: entries.to_vec(), hard_state: hard_state.copied() })?;
        self.state.apply_append(entries, hard_state);
        Ok(())
    }

    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<LogEntry>> {
        self.state.entries(lo, hi)
    }

    fn compact(&mut self, through: u64) -> Result<()> {
        if !self.state.check_compact(through)? {
            return Ok(());
        }
        let previous = self.state.clone();
        self.state.apply_compact(through);
        if let Err(e) = self.rewrite() {
            self.state = previous;
            return Err(e);
        }
        debug!(through, "compacted wal");
        Ok(())
    }

    fn record_snapshot(&mut self, metadata: &SnapshotMetadata) -> Result<()> {
        self.state.check_snapshot(metadata)?;
        self.write_record(&WalRecord::Snapshot { metadata: metadata.clone() })?;
        self.state.apply_snapshot(metadata);
        Ok(())
    }

    fn load(&self) -> Result<PersistedLog> {
        Ok(self.state.clone())
    }

    fn last_index(&self) -> u64 {
        self.state.last_index()
    }
}
