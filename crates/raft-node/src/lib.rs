//! # raft-node
//!
//! why: turn the consensus engine into a running, durable, networked node
//! relations: builds on raft-core (engine) and raft-storage (log and snapshot stores)
//! what: node driver, commit pipeline, tcp transport, application contract, config

pub mod app;
pub mod config;
pub mod driver;
pub mod error;
pub mod kv;
pub mod node;
pub mod pipeline;
pub mod transport;

pub use app::{process_commits, StateMachine};
pub use config::{NodeConfig, SnapshotConfig, TransportConfig};
pub use driver::NodeStatus;
pub use error::{NodeError, Result, StateMachineError};
pub use kv::KvStore;
pub use node::{Node, NodeBuilder};
pub use pipeline::{ApplyDone, CommitBatch};
pub use transport::{TcpTransport, Transport};
