//! # snapshot_store
//!
//! why: keep point-in-time application images so the log can be compacted
//! relations: written by raft-node's snapshot policy, read at startup
//! what: SnapshotStorage trait, FileSnapshotStore, InMemorySnapshotStore

use crate::error::{Result, StorageError};
use crate::wal::sync_dir;
use parking_lot::Mutex;
use raft_core::{Snapshot, SnapshotMetadata};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// durable storage of application snapshots
pub trait SnapshotStorage: Send {
    /// persist a snapshot; indices must never go backwards
    fn save(&mut self, snapshot: &Snapshot) -> Result<()>;

    /// metadata of every stored snapshot, newest first
    fn list(&self) -> Result<Vec<SnapshotMetadata>>;

    fn load_newest(&self) -> Result<Option<Snapshot>>;

    fn load(&self, index: u64) -> Result<Option<Snapshot>>;
}

pub const DEFAULT_MAX_SNAPSHOTS: usize = 5;

/// first line of every snapshot file; the blob follows verbatim
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
    metadata: SnapshotMetadata,
    data_len: u64,
}

/// snapshot files named `{term:016x}-{index:016x}.snap` in one directory
#[derive(Debug)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    max_snapshots: usize,
}

impl FileSnapshotStore {
    pub fn open(dir: impl Into<PathBuf>, max_snapshots: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                warn!(path = %path.display(), "removing unfinished snapshot");
                fs::remove_file(&path)?;
            }
        }
        Ok(Self { dir, max_snapshots: max_snapshots.max(1) })
    }

    fn file_name(metadata: &SnapshotMetadata) -> String {
        format!("{:016x}-{:016x}.snap", metadata.term, metadata.index)
    }

    /// (index, path) of every snapshot file, newest first
    fn files(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(index) = parse_index(&path) {
                files.push((index, path));
            }
        }
        files.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(files)
    }

    fn latest_index(&self) -> Result<u64> {
        Ok(self.files()?.first().map_or(0, |(index, _)| *index))
    }

    fn purge(&self) -> Result<()> {
        for (index, path) in self.files()?.into_iter().skip(self.max_snapshots) {
            debug!(index, "purging old snapshot");
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn parse_index(path: &Path) -> Option<u64> {
    if path.extension()? != "snap" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (_, index) = stem.split_once('-')?;
    u64::from_str_radix(index, 16).ok()
}

fn read_header(reader: &mut BufReader<File>, path: &Path) -> Result<SnapshotHeader> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    serde_json::from_str(line.trim_end()).map_err(|e| StorageError::corrupt(path.display().to_string(), e))
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = read_header(&mut reader, path)?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    if data.len() as u64 != header.data_len {
        return Err(StorageError::corrupt(
            path.display().to_string(),
            format!("expected {} bytes of data, found {}", header.data_len, data.len()),
        ));
    }
    Ok(Snapshot::new(header.metadata, data))
}

impl SnapshotStorage for FileSnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<()> {
        let latest = self.latest_index()?;
        if snapshot.index() < latest {
            return Err(StorageError::SnapshotOutOfOrder { index: snapshot.index(), latest });
        }
        let name = Self::file_name(&snapshot.metadata);
        let header = SnapshotHeader { metadata: snapshot.metadata.clone(), data_len: snapshot.data.len() as u64 };
        let mut bytes = serde_json::to_vec(&header)?;
        bytes.push(b'\n');
        bytes.extend_from_slice(&snapshot.data);

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join(format!("{}.tmp", name));
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.dir.join(&name))?;
        sync_dir(&self.dir)?;

        info!(index = snapshot.index(), term = snapshot.metadata.term, bytes = snapshot.data.len(), "saved snapshot");
        self.purge()
    }

    fn list(&self) -> Result<Vec<SnapshotMetadata>> {
        let mut out = Vec::new();
        for (_, path) in self.files()? {
            let mut reader = BufReader::new(File::open(&path)?);
            out.push(read_header(&mut reader, &path)?.metadata);
        }
        Ok(out)
    }

    fn load_newest(&self) -> Result<Option<Snapshot>> {
        match self.files()?.first() {
            Some((_, path)) => read_snapshot(path).map(Some),
            None => Ok(None),
        }
    }

    fn load(&self, index: u64) -> Result<Option<Snapshot>> {
        match self.files()?.into_iter().find(|(i, _)| *i == index) {
            Some((_, path)) => read_snapshot(&path).map(Some),
            None => Ok(None),
        }
    }
}

// -- in-memory implementation --

/// snapshot store kept in memory; clones share the same snapshots
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<Mutex<Vec<Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStorage for InMemorySnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.lock();
        let latest = snapshots.last().map_or(0, Snapshot::index);
        if snapshot.index() < latest {
            return Err(StorageError::SnapshotOutOfOrder { index: snapshot.index(), latest });
        }
        snapshots.retain(|s| s.index() != snapshot.index());
        snapshots.push(snapshot.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<SnapshotMetadata>> {
        Ok(self.snapshots.lock().iter().rev().map(|s| s.metadata.clone()).collect())
    }

    fn load_newest(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.lock().last().cloned())
    }

    fn load(&self, index: u64) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.lock().iter().find(|s| s.index() == index).cloned())
    }
}
