//! # raft-core
//!
//! why: the consensus engine and the data every other crate agrees on
//! relations: persisted by raft-storage, driven by raft-node through ConsensusEngine
//! what: log and snapshot types, wire messages, RaftNode, the step/ready/advance trait

pub mod engine;
pub mod log;
pub mod message;
pub mod node;

pub use engine::{ConsensusEngine, EngineError, EngineInput, EngineStatus, Ready};
pub use log::{
    ChangeKind, EntryPayload, HardState, LogEntry, Membership, MembershipChange, NodeId, PeerDescriptor, Snapshot,
    SnapshotMetadata,
};
pub use message::{Envelope, RaftMessage};
pub use node::{NodeState, RaftConfig, RaftNode, RestoreState};
