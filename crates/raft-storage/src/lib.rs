//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: written only by raft-node's driver, read back at startup
//! what: LogStorage and SnapshotStorage traits, file-backed and in-memory stores

pub mod error;
pub mod log_store;
pub mod snapshot_store;
pub mod wal;

pub use error::{Result, StorageError};
pub use log_store::{InMemoryLogStore, LogStorage, PersistedLog};
pub use snapshot_store::{FileSnapshotStore, InMemorySnapshotStore, SnapshotStorage, DEFAULT_MAX_SNAPSHOTS};
pub use wal::FileLogStore;
