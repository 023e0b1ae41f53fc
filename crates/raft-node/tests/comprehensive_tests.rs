//! # comprehensive node tests
//!
//! why: verify running nodes end to end over real tcp
//! relations: tests raft-node on top of raft-core and raft-storage
//! what: commit ordering, shutdown, backpressure, durability, snapshots, membership, failures

use raft_core::{HardState, LogEntry, MembershipChange, NodeState, PeerDescriptor, SnapshotMetadata};
use raft_node::{
    process_commits, CommitBatch, KvStore, Node, NodeBuilder, NodeConfig, NodeError, NodeStatus, StateMachine,
    StateMachineError,
};
use raft_storage::{InMemoryLogStore, InMemorySnapshotStore, LogStorage, PersistedLog, SnapshotStorage, StorageError};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(15);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// one listener per node, bound up front so every address is known
fn bind_peers(n: u64) -> (Vec<TcpListener>, Vec<PeerDescriptor>) {
    let listeners: Vec<TcpListener> = (0..n).map(|_| TcpListener::bind("127.0.0.1:0").unwrap()).collect();
    let peers = listeners
        .iter()
        .enumerate()
        .map(|(i, l)| PeerDescriptor::new(i as u64 + 1, l.local_addr().unwrap().to_string()))
        .collect();
    (listeners, peers)
}

fn test_config(id: u64, peers: Vec<PeerDescriptor>) -> NodeConfig {
    let mut config = NodeConfig::new(id, peers, "unused");
    config.tick_interval_ms = 10;
    config.raft.election_timeout_min = 10;
    config.raft.election_timeout_max = 20;
    config.transport.reconnect_backoff_min_ms = 5;
    config.transport.reconnect_backoff_max_ms = 50;
    config
}

fn put(key: &str, val: &str) -> Vec<u8> {
    KvStore::encode_put(key, val)
}

async fn start_in_memory<A: StateMachine>(config: NodeConfig, listener: TcpListener, app: Arc<A>) -> Node {
    NodeBuilder::new(config)
        .listener(listener)
        .log_store(InMemoryLogStore::new())
        .snapshot_store(InMemorySnapshotStore::new())
        .start(app)
        .await
        .unwrap()
}

async fn wait_for_status(node: &Node, check: impl FnMut(&NodeStatus) -> bool) -> NodeStatus {
    let mut status = node.status.clone();
    let result = tokio::time::timeout(WAIT, status.wait_for(check)).await.expect("timed out waiting for status");
    let seen = result.expect("node stopped while waiting for status");
    seen.clone()
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn recv_batch(commits: &mut mpsc::Receiver<CommitBatch>) -> CommitBatch {
    tokio::time::timeout(WAIT, commits.recv())
        .await
        .expect("timed out waiting for a batch")
        .expect("commit stream closed")
}

/// a node whose commits are applied to a KvStore in the background
struct KvNode {
    node: Node,
    kv: Arc<KvStore>,
    applier: JoinHandle<Result<(), StateMachineError>>,
}

impl KvNode {
    async fn start(config: NodeConfig, listener: TcpListener) -> Self {
        let kv = Arc::new(KvStore::new());
        let node = start_in_memory(config, listener, kv.clone()).await;
        Self::attach(node, kv)
    }

    fn attach(mut node: Node, kv: Arc<KvStore>) -> Self {
        let (_, closed) = mpsc::channel(1);
        let mut commits = std::mem::replace(&mut node.commits, closed);
        let app = kv.clone();
        let applier = tokio::spawn(async move { process_commits(app.as_ref(), &mut commits).await });
        Self { node, kv, applier }
    }

    fn has(&self, key: &str, val: &str) -> bool {
        self.kv.lookup(key).as_deref() == Some(val)
    }
}

async fn start_cluster(n: u64, tweak: impl Fn(&mut NodeConfig)) -> Vec<KvNode> {
    let (listeners, peers) = bind_peers(n);
    let mut nodes = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let mut config = test_config(i as u64 + 1, peers.clone());
        tweak(&mut config);
        nodes.push(KvNode::start(config, listener).await);
    }
    nodes
}

/// position of the current leader in `nodes`
async fn wait_leader(nodes: &[KvNode]) -> usize {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(pos) = nodes.iter().position(|n| n.node.status.borrow().role == NodeState::Leader) {
            return pos;
        }
        assert!(tokio::time::Instant::now() < deadline, "no leader elected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// remembers every applied command in order, and the first command of each batch
#[derive(Debug, Default)]
struct Recorder {
    applied: parking_lot::Mutex<Vec<Vec<u8>>>,
    batch_heads: parking_lot::Mutex<Vec<Vec<u8>>>,
}

impl StateMachine for Recorder {
    fn apply(&self, batch: &CommitBatch) -> Result<(), StateMachineError> {
        if let Some(head) = batch.data.first() {
            self.batch_heads.lock().push(head.clone());
        }
        self.applied.lock().extend(batch.data.iter().cloned());
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, StateMachineError> {
        Ok(serde_json::to_vec(&*self.applied.lock())?)
    }

    fn restore(&self, data: &[u8]) -> Result<(), StateMachineError> {
        *self.applied.lock() = serde_json::from_slice(data)?;
        Ok(())
    }
}

/// a log store whose disk is full as soon as a command arrives
#[derive(Debug, Clone, Default)]
struct FailingLog {
    inner: InMemoryLogStore,
}

impl LogStorage for FailingLog {
    fn append(&mut self, entries: &[LogEntry], hard_state: Option<&HardState>) -> raft_storage::Result<()> {
        if entries.iter().any(|e| e.command().is_some()) {
            return Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
        }
        self.inner.append(entries, hard_state)
    }

    fn entries(&self, lo: u64, hi: u64) -> raft_storage::Result<Vec<LogEntry>> {
        self.inner.entries(lo, hi)
    }

    fn compact(&mut self, through: u64) -> raft_storage::Result<()> {
        self.inner.compact(through)
    }

    fn record_snapshot(&mut self, metadata: &SnapshotMetadata) -> raft_storage::Result<()> {
        self.inner.record_snapshot(metadata)
    }

    fn load(&self) -> raft_storage::Result<PersistedLog> {
        self.inner.load()
    }

    fn last_index(&self) -> u64 {
        self.inner.last_index()
    }
}

// =============================================================================
// SECTION 1: SINGLE NODE COMMITS
// =============================================================================

mod single_node {
    use super::*;

    #[tokio::test]
    async fn proposals_are_applied_in_order() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(1);
        let recorder = Arc::new(Recorder::default());
        let mut node = start_in_memory(test_config(1, peers), listeners.remove(0), recorder.clone()).await;
        let mut commits = std::mem::replace(&mut node.commits, mpsc::channel(1).1);
        let app = recorder.clone();
        tokio::spawn(async move { process_commits(app.as_ref(), &mut commits).await });

        let proposals: Vec<Vec<u8>> = (0..25).map(|i| format!("cmd-{}", i).into_bytes()).collect();
        for p in &proposals {
            node.proposals.send(p.clone()).await.unwrap();
        }
        wait_until("all commands applied", || recorder.applied.lock().len() == proposals.len()).await;
        assert_eq!(*recorder.applied.lock(), proposals);
    }

    #[tokio::test]
    async fn closing_intake_drains_then_stops_cleanly() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(1);
        let mut node = start_in_memory(test_config(1, peers), listeners.remove(0), Arc::new(KvStore::new())).await;

        node.proposals.send(b"foo".to_vec()).await.unwrap();
        node.proposals.send(b"bar".to_vec()).await.unwrap();
        let (closed, _) = mpsc::channel(1);
        drop(std::mem::replace(&mut node.proposals, closed));

        let mut first = recv_batch(&mut node.commits).await;
        assert_eq!(first.data[0], b"foo".to_vec());
        let mut seen = first.data.clone();
        first.complete();

        while let Some(mut batch) = tokio::time::timeout(WAIT, node.commits.recv()).await.unwrap() {
            seen.extend(batch.data.iter().cloned());
            batch.complete();
        }
        assert_eq!(seen, vec![b"foo".to_vec(), b"bar".to_vec()]);
        let error = tokio::time::timeout(WAIT, node.errors.recv()).await.unwrap();
        assert!(error.is_none(), "clean drain reported {:?}", error);
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_batch_in_flight() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(1);
        let mut node = start_in_memory(test_config(1, peers), listeners.remove(0), Arc::new(KvStore::new())).await;

        node.proposals.send(put("a", "1")).await.unwrap();
        let mut batch = recv_batch(&mut node.commits).await;
        node.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!node.is_finished());

        batch.complete();
        let next = tokio::time::timeout(WAIT, node.commits.recv()).await.unwrap();
        assert!(next.is_none());
        assert!(tokio::time::timeout(WAIT, node.errors.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completing_twice_is_a_no_op() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(1);
        let mut node = start_in_memory(test_config(1, peers), listeners.remove(0), Arc::new(KvStore::new())).await;

        node.proposals.send(put("a", "1")).await.unwrap();
        let mut batch = recv_batch(&mut node.commits).await;
        assert!(batch.complete());
        assert!(!batch.complete());

        node.proposals.send(put("b", "2")).await.unwrap();
        let mut next = recv_batch(&mut node.commits).await;
        assert_eq!(next.data, vec![put("b", "2")]);
        assert!(next.last_index > batch.last_index);
        next.complete();
        wait_for_status(&node, |s| s.applied_index == next.last_index).await;
    }

    #[tokio::test]
    async fn deferred_completion_can_outlive_the_batch() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(1);
        let mut node = start_in_memory(test_config(1, peers), listeners.remove(0), Arc::new(KvStore::new())).await;

        node.proposals.send(put("a", "1")).await.unwrap();
        let mut batch = recv_batch(&mut node.commits).await;
        let last_index = batch.last_index;
        let mut done = batch.take_done();
        drop(batch);
        assert!(!done.is_fired());
        assert!(done.fire());
        wait_for_status(&node, |s| s.applied_index == last_index).await;
    }
}

// =============================================================================
// SECTION 2: BACKPRESSURE
// =============================================================================

mod backpressure {
    use super::*;

    #[tokio::test]
    async fn slow_application_does_not_stall_consensus() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(1);
        let mut node = start_in_memory(test_config(1, peers), listeners.remove(0), Arc::new(KvStore::new())).await;
        let settled = wait_for_status(&node, |s| s.role == NodeState::Leader && s.applied_index == s.last_index).await;

        node.proposals.send(put("first", "0")).await.unwrap();
        let mut first = recv_batch(&mut node.commits).await;
        assert_eq!(first.data.len(), 1);

        for i in 0..20 {
            node.proposals.send(put(&format!("k{}", i), "v")).await.unwrap();
        }
        wait_for_status(&node, |s| s.commit_index >= first.last_index + 20).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(node.commits.try_recv().is_err(), "second batch published before the first completed");
        assert_eq!(node.status.borrow().applied_index, settled.applied_index);

        first.complete();
        let mut delivered = 0;
        while delivered < 20 {
            let mut batch = recv_batch(&mut node.commits).await;
            delivered += batch.data.len();
            batch.complete();
        }
        assert_eq!(delivered, 20);
        wait_for_status(&node, |s| s.applied_index == first.last_index + 20).await;
    }

    #[tokio::test]
    async fn proposals_before_election_are_kept_in_order() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(1);
        let recorder = Arc::new(Recorder::default());
        let mut config = test_config(1, peers);
        // a slow first election leaves the proposals waiting for a leader
        config.raft.election_timeout_min = 30;
        config.raft.election_timeout_max = 40;
        let mut node = start_in_memory(config, listeners.remove(0), recorder.clone()).await;
        for i in 0..5 {
            node.proposals.send(vec![i]).await.unwrap();
        }
        let queued = wait_for_status(&node, |s| s.backlog == 5).await;
        assert_ne!(queued.role, NodeState::Leader);

        let mut applied = Vec::new();
        while applied.len() < 5 {
            let mut batch = recv_batch(&mut node.commits).await;
            applied.extend(batch.data.iter().cloned());
            batch.complete();
        }
        assert_eq!(applied, (0..5).map(|i| vec![i]).collect::<Vec<_>>());
        wait_for_status(&node, |s| s.backlog == 0).await;
    }
}

// =============================================================================
// SECTION 3: DURABILITY
// =============================================================================

mod durability {
    use super::*;

    #[tokio::test]
    async fn entries_are_durable_before_delivery() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(1);
        let log = InMemoryLogStore::new();
        let mut node = NodeBuilder::new(test_config(1, peers))
            .listener(listeners.remove(0))
            .log_store(log.clone())
            .snapshot_store(InMemorySnapshotStore::new())
            .start(Arc::new(KvStore::new()))
            .await
            .unwrap();

        for i in 0..10 {
            node.proposals.send(put(&format!("k{}", i), "v")).await.unwrap();
        }
        let mut delivered = 0;
        while delivered < 10 {
            let mut batch = recv_batch(&mut node.commits).await;
            assert!(log.last_index() >= batch.last_index);
            assert!(log.load().unwrap().hard_state.commit >= batch.last_index);
            delivered += batch.data.len();
            batch.complete();
        }
    }

    #[tokio::test]
    async fn persistence_failure_is_fatal() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(1);
        let mut node = NodeBuilder::new(test_config(1, peers))
            .listener(listeners.remove(0))
            .log_store(FailingLog::default())
            .snapshot_store(InMemorySnapshotStore::new())
            .start(Arc::new(KvStore::new()))
            .await
            .unwrap();

        node.proposals.send(put("lost", "1")).await.unwrap();
        let error = tokio::time::timeout(WAIT, node.errors.recv()).await.unwrap();
        assert!(matches!(error, Some(NodeError::Storage(StorageError::Io(_)))), "got {:?}", error);

        while let Some(batch) = tokio::time::timeout(WAIT, node.commits.recv()).await.unwrap() {
            assert!(!batch.data.contains(&put("lost", "1")), "undurable entry was delivered");
        }
    }

    #[tokio::test]
    async fn undecodable_command_is_fatal() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(1);
        let mut kv = KvNode::start(test_config(1, peers), listeners.remove(0)).await;

        kv.node.proposals.send(put("good", "1")).await.unwrap();
        kv.node.proposals.send(b"not json".to_vec()).await.unwrap();
        let error = tokio::time::timeout(WAIT, kv.node.errors.recv()).await.unwrap();
        assert!(
            matches!(error, Some(NodeError::StateMachine(StateMachineError::Decode(_)))),
            "got {:?}",
            error
        );
        assert!(tokio::time::timeout(WAIT, kv.node.errors.recv()).await.unwrap().is_none());
        wait_until("node stopped", || kv.node.is_finished()).await;

        let applier = tokio::time::timeout(WAIT, &mut kv.applier).await.unwrap().unwrap();
        assert!(matches!(applier, Err(StateMachineError::Aborted { .. })), "got {:?}", applier);
    }

    #[tokio::test]
    async fn restart_replays_snapshot_and_log() {
        init_tracing();
        let dir = tempdir().unwrap();
        let config_for = |listener: &TcpListener| {
            let peers = vec![PeerDescriptor::new(1, listener.local_addr().unwrap().to_string())];
            let mut config = test_config(1, peers);
            config.data_dir = dir.path().to_path_buf();
            config.snapshot.snapshot_count = 4;
            config.snapshot.catch_up_entries = 2;
            config
        };

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let kv = Arc::new(KvStore::new());
        let node = NodeBuilder::new(config_for(&listener)).listener(listener).start(kv.clone()).await.unwrap();
        let first = KvNode::attach(node, kv);
        for i in 0..10 {
            first.node.proposals.send(put(&format!("k{}", i), &i.to_string())).await.unwrap();
        }
        wait_until("first run applied", || first.has("k9", "9")).await;
        wait_for_status(&first.node, |s| s.snapshot_index > 0).await;
        first.node.shutdown();
        wait_until("first run stopped", || first.node.is_finished()).await;
        assert!(dir.path().join("snap").read_dir().unwrap().next().is_some());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let kv = Arc::new(KvStore::new());
        let node = NodeBuilder::new(config_for(&listener)).listener(listener).start(kv.clone()).await.unwrap();
        let second = KvNode::attach(node, kv);
        wait_until("second run replayed", || second.has("k9", "9")).await;
        assert_eq!(second.kv.len(), 10);
        for i in 0..10 {
            assert!(second.has(&format!("k{}", i), &i.to_string()));
        }

        second.node.proposals.send(put("k10", "10")).await.unwrap();
        wait_until("new proposal after restart", || second.has("k10", "10")).await;
    }
}

// =============================================================================
// SECTION 4: SNAPSHOTS
// =============================================================================

mod snapshots {
    use super::*;

    #[tokio::test]
    async fn snapshot_waits_for_acknowledgement() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(1);
        let mut config = test_config(1, peers);
        config.snapshot.snapshot_count = 4;
        let snapshots = InMemorySnapshotStore::new();
        let app = Arc::new(KvStore::new());
        let mut node = NodeBuilder::new(config)
            .listener(listeners.remove(0))
            .log_store(InMemoryLogStore::new())
            .snapshot_store(snapshots.clone())
            .start(app.clone())
            .await
            .unwrap();
        let settled = wait_for_status(&node, |s| s.role == NodeState::Leader && s.applied_index == s.last_index).await;
        let base = settled.last_index;

        for i in 0..4 {
            node.proposals.send(put(&format!("k{}", i), &i.to_string())).await.unwrap();
        }
        let mut held = recv_batch(&mut node.commits).await;
        wait_for_status(&node, |s| s.commit_index >= base + 4).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(snapshots.list().unwrap().is_empty(), "snapshot taken before the application caught up");

        let mut applied = held.data.len();
        app.apply(&held).unwrap();
        held.complete();
        while applied < 4 {
            let mut batch = recv_batch(&mut node.commits).await;
            app.apply(&batch).unwrap();
            applied += batch.data.len();
            batch.complete();
        }

        wait_until("snapshot taken", || !snapshots.list().unwrap().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let list = snapshots.list().unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].index > 4);
        assert!(list[0].membership.contains(1));

        let image = snapshots.load(list[0].index).unwrap().unwrap();
        let restored = KvStore::new();
        restored.restore(&image.data).unwrap();
        assert_eq!(restored.len() as u64, list[0].index - base);
    }

    #[tokio::test]
    async fn busy_application_still_gets_snapshots() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(1);
        let mut config = test_config(1, peers);
        config.snapshot.snapshot_count = 4;
        config.snapshot.catch_up_entries = 2;
        let snapshots = InMemorySnapshotStore::new();
        let mut node = NodeBuilder::new(config)
            .listener(listeners.remove(0))
            .log_store(InMemoryLogStore::new())
            .snapshot_store(snapshots.clone())
            .start(Arc::new(KvStore::new()))
            .await
            .unwrap();

        node.proposals.send(put("k0", "0")).await.unwrap();
        let mut held = recv_batch(&mut node.commits).await;
        // every completion finds the next batch already waiting
        for round in 1..=5 {
            for i in 0..5 {
                node.proposals.send(put(&format!("k{}-{}", round, i), "v")).await.unwrap();
            }
            let target = held.last_index + 5;
            wait_for_status(&node, |s| s.commit_index >= target).await;
            assert!(held.complete());
            held = recv_batch(&mut node.commits).await;
        }

        let status = wait_for_status(&node, |s| s.snapshot_index > 0).await;
        assert!(status.snapshot_index <= status.applied_index);
        assert!(status.snapshot_index < held.last_index);
        let list = snapshots.list().unwrap();
        assert!(!list.is_empty());
        assert_eq!(list[0].index, status.snapshot_index);
        held.complete();
    }

    #[tokio::test]
    async fn joining_node_catches_up_from_a_snapshot() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(4);
        let joiner_listener = listeners.pop().unwrap();
        let mut nodes = Vec::new();
        for (i, listener) in listeners.into_iter().enumerate() {
            let mut config = test_config(i as u64 + 1, peers[..3].to_vec());
            config.snapshot.snapshot_count = 4;
            config.snapshot.catch_up_entries = 0;
            nodes.push(KvNode::start(config, listener).await);
        }
        let leader = wait_leader(&nodes).await;
        for i in 0..10 {
            nodes[leader].node.proposals.send(put(&format!("k{}", i), &i.to_string())).await.unwrap();
        }
        wait_until("cluster applied", || nodes.iter().all(|n| n.has("k9", "9"))).await;
        wait_for_status(&nodes[leader].node, |s| s.snapshot_index > 0).await;

        let mut config = test_config(4, peers.clone());
        config.join = true;
        let joiner = KvNode::start(config, joiner_listener).await;
        nodes[leader].node.membership.send(MembershipChange::add(4, peers[3].address.clone())).await.unwrap();

        wait_until("joiner restored", || joiner.has("k9", "9")).await;
        let status = wait_for_status(&joiner.node, |s| s.membership.len() == 4).await;
        assert!(status.snapshot_index > 0);

        nodes[leader].node.proposals.send(put("late", "yes")).await.unwrap();
        wait_until("joiner follows new entries", || joiner.has("late", "yes")).await;
        wait_until("late everywhere", || nodes.iter().all(|n| n.has("late", "yes"))).await;
        for node in nodes.iter().chain(std::iter::once(&joiner)) {
            let status = wait_for_status(&node.node, |s| s.membership.len() == 4).await;
            assert_eq!(status.membership.ids(), vec![1, 2, 3, 4]);
        }
    }
}

// =============================================================================
// SECTION 5: CLUSTERS
// =============================================================================

mod cluster {
    use super::*;

    #[tokio::test]
    async fn proposal_reaches_every_node() {
        init_tracing();
        let (listeners, peers) = bind_peers(3);
        let mut nodes = Vec::new();
        for (i, listener) in listeners.into_iter().enumerate() {
            let recorder = Arc::new(Recorder::default());
            let mut node = start_in_memory(test_config(i as u64 + 1, peers.clone()), listener, recorder.clone()).await;
            let mut commits = std::mem::replace(&mut node.commits, mpsc::channel(1).1);
            let app = recorder.clone();
            tokio::spawn(async move { process_commits(app.as_ref(), &mut commits).await });
            nodes.push((node, recorder));
        }
        wait_for_status(&nodes[0].0, |s| s.leader.is_some()).await;

        // followers forward to the leader
        let sent: Vec<Vec<u8>> = (1..=3).map(|i| format!("foo-{}", i).into_bytes()).collect();
        for ((node, _), data) in nodes.iter().zip(&sent) {
            node.proposals.send(data.clone()).await.unwrap();
        }
        wait_until("every command everywhere", || nodes.iter().all(|(_, r)| r.applied.lock().len() == 3)).await;

        let order = nodes[0].1.applied.lock().clone();
        for (node, recorder) in &nodes {
            let mut applied = recorder.applied.lock().clone();
            assert_eq!(applied, order, "node {} applied a different order", node.id);
            applied.sort();
            assert_eq!(applied, sent);
            let first = recorder.batch_heads.lock()[0].clone();
            assert!(first.starts_with(b"foo"), "node {} first batch began with {:?}", node.id, first);
            assert_eq!(node.status.borrow().membership.len(), 3);
        }
    }

    #[tokio::test]
    async fn removed_member_leaves_the_peer_set() {
        init_tracing();
        let nodes = start_cluster(3, |_| {}).await;
        let leader = wait_leader(&nodes).await;
        let follower = (leader + 1) % nodes.len();
        let removed_id = nodes[follower].node.id;

        nodes[leader].node.membership.send(MembershipChange::remove(removed_id)).await.unwrap();
        let status = wait_for_status(&nodes[leader].node, |s| !s.membership.contains(removed_id)).await;
        assert_eq!(status.membership.len(), 2);

        let survivor = (leader + 2) % nodes.len();
        nodes[leader].node.proposals.send(put("after", "removal")).await.unwrap();
        wait_until("survivors commit", || nodes[leader].has("after", "removal") && nodes[survivor].has("after", "removal"))
            .await;
    }

    #[tokio::test]
    async fn unreachable_peer_is_reported() {
        init_tracing();
        let (mut listeners, peers) = bind_peers(3);
        // node 3 never starts
        drop(listeners.pop());
        let mut nodes = Vec::new();
        for (i, listener) in listeners.into_iter().enumerate() {
            let mut config = test_config(i as u64 + 1, peers.clone());
            config.transport.unreachable_after_failures = 3;
            nodes.push(KvNode::start(config, listener).await);
        }
        wait_leader(&nodes).await;

        nodes[0].node.proposals.send(put("quorum", "of two")).await.unwrap();
        wait_until("two of three commit", || nodes.iter().all(|n| n.has("quorum", "of two"))).await;

        let status = wait_for_status(&nodes[0].node, |s| !s.unreachable.is_empty()).await;
        assert_eq!(status.unreachable, vec![3]);
    }
}
