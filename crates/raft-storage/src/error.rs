//! # error
//!
//! why: one error type for both durable stores
//! relations: returned by log_store.rs, wal.rs, snapshot_store.rs; wrapped by raft-node
//! what: StorageError, Result alias

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("index {index} has been compacted")]
    Compacted { index: u64 },

    #[error("index {index} is not available")]
    Unavailable { index: u64 },

    #[error("append leaves a gap: expected index {expected}, found {found}")]
    Gap { expected: u64, found: u64 },

    #[error("cannot compact through {through}: newest snapshot is at {snapshot}")]
    CompactBeyondSnapshot { through: u64, snapshot: u64 },

    #[error("cannot compact through {through}: commit index is {commit}")]
    CompactBeyondCommit { through: u64, commit: u64 },

    #[error("snapshot at {index} is older than stored snapshot at {latest}")]
    SnapshotOutOfOrder { index: u64, latest: u64 },

    #[error("corrupt {what}: {reason}")]
    Corrupt { what: String, reason: String },
}

impl StorageError {
    pub(crate) fn corrupt(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupt { what: what.into(), reason: reason.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
