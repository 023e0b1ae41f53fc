//! # config
//!
//! why: every knob of a node passed in explicitly, loadable from a json file
//! relations: consumed by node.rs (startup), driver.rs (snapshot policy), transport.rs
//! what: NodeConfig, SnapshotConfig, TransportConfig with defaults and validation

use crate::error::{NodeError, Result};
use raft_core::{NodeId, PeerDescriptor, RaftConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// when to snapshot and how much log to keep behind a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// entries applied since the last snapshot before a new one is taken
    pub snapshot_count: u64,
    /// entries kept below a snapshot so slow peers can catch up from the log
    pub catch_up_entries: u64,
    pub max_snapshots: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { snapshot_count: 10_000, catch_up_entries: 10_000, max_snapshots: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// outbound messages buffered per peer before new ones are dropped
    pub peer_queue_capacity: usize,
    /// inbound messages buffered for the driver
    pub inbound_capacity: usize,
    pub reconnect_backoff_min_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    /// consecutive failures before a peer is reported unreachable
    pub unreachable_after_failures: u32,
    /// tries per message, the first send included, before it is dropped
    pub delivery_attempts: u32,
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            peer_queue_capacity: 1024,
            inbound_capacity: 4096,
            reconnect_backoff_min_ms: 50,
            reconnect_backoff_max_ms: 2_000,
            unreachable_after_failures: 5,
            delivery_attempts: 3,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: NodeId,
    /// initial peer set, including this node's own listen address
    pub peers: Vec<PeerDescriptor>,
    /// start empty and wait to be added by a running cluster
    pub join: bool,
    pub data_dir: PathBuf,
    pub tick_interval_ms: u64,
    /// capacity of the proposal and membership intakes
    pub intake_capacity: usize,
    /// upper bound on the orderly drain after the proposal intake closes
    pub drain_timeout_ms: u64,
    pub snapshot: SnapshotConfig,
    pub raft: RaftConfig,
    pub transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            peers: Vec::new(),
            join: false,
            data_dir: PathBuf::from("raft-data"),
            tick_interval_ms: 100,
            intake_capacity: 256,
            drain_timeout_ms: 5_000,
            snapshot: SnapshotConfig::default(),
            raft: RaftConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(id: NodeId, peers: Vec<PeerDescriptor>, data_dir: impl Into<PathBuf>) -> Self {
        Self { id, peers, data_dir: data_dir.into(), ..Self::default() }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// this node's own entry in `peers`
    pub fn own_address(&self) -> Option<&str> {
        self.peers.iter().find(|p| p.id == self.id).map(|p| p.address.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(NodeError::Config(msg));
        if self.id == 0 {
            return fail("node id 0 is reserved".into());
        }
        if self.own_address().is_none() {
            return fail(format!("peers must include node {} itself", self.id));
        }
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id) {
                return fail(format!("peer {} listed twice", peer.id));
            }
        }
        if self.tick_interval_ms == 0 {
            return fail("tick_interval_ms must be positive".into());
        }
        if self.intake_capacity == 0 {
            return fail("intake_capacity must be positive".into());
        }
        let raft = &self.raft;
        if raft.election_timeout_min == 0 || raft.election_timeout_min > raft.election_timeout_max {
            return fail(format!(
                "election timeout range {}..={} is invalid",
                raft.election_timeout_min, raft.election_timeout_max
            ));
        }
        if raft.heartbeat_interval == 0 || raft.heartbeat_interval >= raft.election_timeout_min {
            return fail("heartbeat_interval must be positive and below election_timeout_min".into());
        }
        if raft.max_entries_per_message == 0 {
            return fail("max_entries_per_message must be positive".into());
        }
        if self.snapshot.snapshot_count == 0 {
            return fail("snapshot_count must be positive".into());
        }
        if self.transport.peer_queue_capacity == 0 || self.transport.inbound_capacity == 0 {
            return fail("transport queues must have capacity".into());
        }
        if self.transport.delivery_attempts == 0 {
            return fail("delivery_attempts must be positive".into());
        }
        Ok(())
    }
}
