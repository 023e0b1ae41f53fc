//! # error
//!
//! why: everything that can stop a node, in one place
//! relations: returned by driver.rs and node.rs, emitted on the node's error stream
//! what: NodeError, StateMachineError, Result alias

use raft_core::EngineError;
use raft_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    /// durable state could not be read or written
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("consensus engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("corrupt committed entry at index {index}: {reason}")]
    CorruptEntry { index: u64, reason: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// failures reported by an application state machine
#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("cannot decode command: {0}")]
    Decode(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// a batch that failed to apply; the cause went to the node with `CommitBatch::fail`
    #[error("batch ending at index {index} failed: {reason}")]
    Aborted { index: u64, reason: String },
}

pub type Result<T> = std::result::Result<T, NodeError>;
