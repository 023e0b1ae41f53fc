//! # node
//!
//! why: assemble stores, engine, transport and driver into one running node
//! relations: the crate's entry point; spawns driver.rs
//! what: NodeBuilder (startup and recovery) and Node (the handles an application holds)

use crate::app::StateMachine;
use crate::config::NodeConfig;
use crate::driver::{Intake, NodeDriver, NodeStatus, Stores};
use crate::error::{NodeError, Result};
use crate::pipeline::{CommitBatch, CommitPublisher};
use crate::transport::{TcpTransport, Transport};
use raft_core::{MembershipChange, NodeId, RaftNode, RestoreState};
use raft_storage::{FileLogStore, FileSnapshotStore, LogStorage, SnapshotStorage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// the application's handles on a running node
///
/// dropping `proposals` starts an orderly drain; `commits` ends when the node
/// stops, and `errors` yields at most one fatal error before closing
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub proposals: mpsc::Sender<Vec<u8>>,
    pub membership: mpsc::Sender<MembershipChange>,
    pub commits: mpsc::Receiver<CommitBatch>,
    pub errors: mpsc::Receiver<NodeError>,
    pub status: watch::Receiver<NodeStatus>,
    pub local_addr: SocketAddr,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Node {
    /// stop after the batch currently with the application is acknowledged
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// a token that stops the node when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

pub struct NodeBuilder {
    config: NodeConfig,
    listener: Option<std::net::TcpListener>,
    log_store: Option<Box<dyn LogStorage>>,
    snapshot_store: Option<Box<dyn SnapshotStorage>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self { config, listener: None, log_store: None, snapshot_store: None }
    }

    /// use an already bound listener instead of binding the configured address
    pub fn listener(mut self, listener: std::net::TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn log_store(mut self, store: impl LogStorage + 'static) -> Self {
        self.log_store = Some(Box::new(store));
        self
    }

    pub fn snapshot_store(mut self, store: impl SnapshotStorage + 'static) -> Self {
        self.snapshot_store = Some(Box::new(store));
        self
    }

    /// recover durable state, restore the application, and spawn the driver
    pub async fn start<A>(self, app: Arc<A>) -> Result<Node>
    where
        A: StateMachine + ?Sized,
    {
        let config = self.config;
        config.validate()?;
        let id = config.id;

        let mut log: Box<dyn LogStorage> = match self.log_store {
            Some(store) => store,
            None => Box::new(FileLogStore::open(config.data_dir.join("wal"))?),
        };
        let snapshots: Box<dyn SnapshotStorage> = match self.snapshot_store {
            Some(store) => store,
            None => Box::new(FileSnapshotStore::open(config.data_dir.join("snap"), config.snapshot.max_snapshots)?),
        };

        // a snapshot saved just before a crash may be newer than the log's mark
        let mut persisted = log.load()?;
        if let Some(newest) = snapshots.load_newest()? {
            if newest.index() > persisted.snapshot_index() {
                info!(node_id = id, index = newest.index(), "recording snapshot missing from the log");
                log.record_snapshot(&newest.metadata)?;
                persisted = log.load()?;
            }
        }
        let snapshot = match &persisted.snapshot {
            Some(metadata) => Some(snapshots.load(metadata.index)?.ok_or_else(|| {
                NodeError::ProtocolViolation(format!("log references missing snapshot {}", metadata.index))
            })?),
            None => None,
        };
        if let Some(snapshot) = &snapshot {
            info!(node_id = id, index = snapshot.index(), "restoring application from snapshot");
            app.restore(&snapshot.data)?;
        }
        let base = snapshot.as_ref().map(|s| s.metadata.clone());

        let engine = if persisted.is_empty() {
            if config.join {
                info!(node_id = id, "starting empty, waiting to be added");
                RaftNode::blank(id, config.raft.clone())
            } else {
                let peers = config.peers.iter().map(|p| (p.id, p.address.clone())).collect();
                info!(node_id = id, peers = config.peers.len(), "bootstrapping new cluster");
                RaftNode::bootstrap(id, peers, config.raft.clone())
            }
        } else {
            info!(
                node_id = id,
                last_index = persisted.last_index(),
                term = persisted.hard_state.term,
                "recovering from durable log"
            );
            let state = RestoreState {
                snapshot,
                hard_state: persisted.hard_state,
                base_index: persisted.base_index,
                base_term: persisted.base_term,
                entries: persisted.entries,
            };
            RaftNode::restore(id, config.raft.clone(), state)?
        };

        let listener = match self.listener {
            Some(listener) => {
                listener.set_nonblocking(true)?;
                TcpListener::from_std(listener)?
            }
            None => {
                let address = config
                    .own_address()
                    .ok_or_else(|| NodeError::Config(format!("no address for node {}", id)))?;
                TcpListener::bind(address).await?
            }
        };
        let (inbound_tx, inbound_rx) = mpsc::channel(config.transport.inbound_capacity);
        let mut transport = TcpTransport::start(id, listener, inbound_tx, config.transport.clone())?;
        let local_addr = transport.local_addr();
        for peer in &config.peers {
            transport.add_peer(peer);
        }
        if let Some(base) = &base {
            for peer in base.membership.descriptors() {
                transport.add_peer(&peer);
            }
        }

        let (proposals_tx, proposals_rx) = mpsc::channel(config.intake_capacity);
        let (membership_tx, membership_rx) = mpsc::channel(config.intake_capacity);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(NodeStatus { id, ..NodeStatus::default() });
        let (publisher, commits_rx) = CommitPublisher::new();
        let stop = CancellationToken::new();

        let driver = NodeDriver::new(
            &config,
            engine,
            app,
            Stores { log, snapshots },
            Box::new(transport),
            publisher,
            status_tx,
            Intake { proposals: proposals_rx, membership: membership_rx, inbound: inbound_rx, stop: stop.clone() },
            base.as_ref(),
        );
        let handle = tokio::spawn(async move {
            if let Err(e) = driver.run().await {
                if errors_tx.send(e).await.is_err() {
                    warn!(node_id = id, "fatal error with nobody listening");
                }
            }
        });
        info!(node_id = id, addr = %local_addr, "node started");

        Ok(Node {
            id,
            proposals: proposals_tx,
            membership: membership_tx,
            commits: commits_rx,
            errors: errors_rx,
            status: status_rx,
            local_addr,
            stop,
            handle,
        })
    }
}
