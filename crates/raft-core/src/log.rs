//! # log
//!
//! why: describe what the replicated log carries and what must survive a restart
//! relations: produced by node.rs, persisted via raft-storage, decoded by raft-node
//! what: LogEntry, EntryPayload, membership records, HardState, snapshot types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// identifier of a cluster member
pub type NodeId = u64;

/// what a log entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// leader no-op appended at the start of every term
    Empty,
    /// opaque application proposal
    Command(#[serde(with = "base64_bytes")] Vec<u8>),
    /// replicated change to the peer set
    Membership(MembershipChange),
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    /// Create a new log entry carrying an application command
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, payload: EntryPayload::Command(command) }
    }

    pub fn empty(term: u64, index: u64) -> Self {
        Self { term, index, payload: EntryPayload::Empty }
    }

    pub fn membership(term: u64, index: u64, change: MembershipChange) -> Self {
        Self { term, index, payload: EntryPayload::Membership(change) }
    }

    /// the application bytes, if this is a command entry
    pub fn command(&self) -> Option<&[u8]> {
        match &self.payload {
            EntryPayload::Command(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_membership(&self) -> bool {
        matches!(self.payload, EntryPayload::Membership(_))
    }
}

// -- membership --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    AddNode,
    RemoveNode,
}

/// an operator request to add or remove a member
///
/// only takes effect once the entry carrying it has been committed and applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub kind: ChangeKind,
    pub node_id: NodeId,
    pub address: String,
}

impl MembershipChange {
    pub fn add(node_id: NodeId, address: impl Into<String>) -> Self {
        Self { kind: ChangeKind::AddNode, node_id, address: address.into() }
    }

    pub fn remove(node_id: NodeId) -> Self {
        Self { kind: ChangeKind::RemoveNode, node_id, address: String::new() }
    }
}

/// node id plus the address its transport listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: NodeId,
    pub address: String,
}

impl PeerDescriptor {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self { id, address: address.into() }
    }
}

/// the replicated peer set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    peers: BTreeMap<NodeId, String>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_peers<I>(peers: I) -> Self
    where
        I: IntoIterator<Item = PeerDescriptor>,
    {
        Self { peers: peers.into_iter().map(|p| (p.id, p.address)).collect() }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.peers.contains_key(&id)
    }

    /// member ids in ascending order
    pub fn ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    pub fn address(&self, id: NodeId) -> Option<&str> {
        self.peers.get(&id).map(String::as_str)
    }

    pub fn descriptors(&self) -> Vec<PeerDescriptor> {
        self.peers.iter().map(|(id, addr)| PeerDescriptor::new(*id, addr.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn insert(&mut self, id: NodeId, address: impl Into<String>) {
        self.peers.insert(id, address.into());
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        self.peers.remove(&id).is_some()
    }

    /// fold a committed change into the set
    pub fn apply(&mut self, change: &MembershipChange) {
        match change.kind {
            ChangeKind::AddNode => self.insert(change.node_id, change.address.clone()),
            ChangeKind::RemoveNode => {
                self.remove(change.node_id);
            }
        }
    }
}

// -- durable state --

/// term, vote and commit index; persisted before any message it authorizes is sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub commit: u64,
}

/// which log prefix a snapshot blob stands in for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub index: u64,
    pub term: u64,
    pub membership: Membership,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(metadata: SnapshotMetadata, data: Vec<u8>) -> Self {
        Self { metadata, data }
    }

    pub fn index(&self) -> u64 {
        self.metadata.index
    }
}

/// opaque bytes as one base64 string, not a json array of numbers
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}
