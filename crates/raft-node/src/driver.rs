//! # driver
//!
//! why: one task owns the consensus engine, the durable stores and the transport
//! relations: spawned by node.rs; drives raft_core::ConsensusEngine, raft_storage, transport.rs, pipeline.rs
//! what: NodeDriver event loop, ready handling, snapshot policy, membership intents, NodeStatus
//!
//! every ready is handled in the same order: persist, send, deliver, advance.
//! nothing reaches the network or the application before it is durable.

use crate::app::StateMachine;
use crate::config::{NodeConfig, SnapshotConfig};
use crate::error::{NodeError, Result};
use crate::pipeline::{CommitPublisher, Completion, PipelineClosed};
use crate::transport::Transport;
use raft_core::{
    ChangeKind, ConsensusEngine, EngineError, EngineInput, EntryPayload, Envelope, LogEntry, Membership,
    MembershipChange, NodeId, NodeState, PeerDescriptor, Ready, Snapshot, SnapshotMetadata,
};
use raft_storage::{LogStorage, SnapshotStorage};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// a node as seen from outside, republished whenever it changes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub term: u64,
    pub role: NodeState,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    /// highest index the application has acknowledged
    pub applied_index: u64,
    pub snapshot_index: u64,
    pub last_index: u64,
    pub membership: Membership,
    /// proposals waiting for a leader
    pub backlog: usize,
    pub unreachable: Vec<NodeId>,
}

/// the receiving ends the driver listens on
pub(crate) struct Intake {
    pub proposals: mpsc::Receiver<Vec<u8>>,
    pub membership: mpsc::Receiver<MembershipChange>,
    pub inbound: mpsc::Receiver<Envelope>,
    pub stop: CancellationToken,
}

pub(crate) struct Stores {
    pub log: Box<dyn LogStorage>,
    pub snapshots: Box<dyn SnapshotStorage>,
}

enum Event {
    Stop,
    Applied(Completion),
    Tick,
    Message(Envelope),
    /// None once the proposal intake is closed
    Proposal(Option<Vec<u8>>),
    Membership(MembershipChange),
}

/// a membership change handed to the engine but not applied yet
#[derive(Debug)]
struct Outstanding {
    change: MembershipChange,
    ticks: u64,
}

pub(crate) struct NodeDriver<E, A: ?Sized> {
    id: NodeId,
    engine: E,
    app: Arc<A>,
    log: Box<dyn LogStorage>,
    snapshots: Box<dyn SnapshotStorage>,
    transport: Box<dyn Transport>,
    publisher: CommitPublisher,
    status: watch::Sender<NodeStatus>,

    proposals: Option<mpsc::Receiver<Vec<u8>>>,
    membership_rx: mpsc::Receiver<MembershipChange>,
    inbound: mpsc::Receiver<Envelope>,
    stop: CancellationToken,

    tick_interval: Duration,
    drain_timeout: Duration,
    snapshot_config: SnapshotConfig,
    backlog_limit: usize,
    resubmit_after: u64,

    backlog: VecDeque<Vec<u8>>,
    intents: VecDeque<MembershipChange>,
    outstanding: Option<Outstanding>,
    /// membership in effect after each applied change, oldest first
    history: Vec<(u64, Membership)>,
    delivered_index: u64,
    applied_index: u64,
    snapshot_index: u64,
    removed: bool,
    app_gone: bool,
}

impl<E, A> NodeDriver<E, A>
where
    E: ConsensusEngine,
    A: StateMachine + ?Sized,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: &NodeConfig,
        engine: E,
        app: Arc<A>,
        stores: Stores,
        transport: Box<dyn Transport>,
        publisher: CommitPublisher,
        status: watch::Sender<NodeStatus>,
        intake: Intake,
        base: Option<&SnapshotMetadata>,
    ) -> Self {
        let base_index = base.map_or(0, |m| m.index);
        let base_membership = base.map(|m| m.membership.clone()).unwrap_or_default();
        Self {
            id: config.id,
            engine,
            app,
            log: stores.log,
            snapshots: stores.snapshots,
            transport,
            publisher,
            status,
            proposals: Some(intake.proposals),
            membership_rx: intake.membership,
            inbound: intake.inbound,
            stop: intake.stop,
            tick_interval: config.tick_interval(),
            drain_timeout: config.drain_timeout(),
            snapshot_config: config.snapshot.clone(),
            backlog_limit: config.intake_capacity,
            resubmit_after: config.raft.election_timeout_max,
            backlog: VecDeque::new(),
            intents: VecDeque::new(),
            outstanding: None,
            history: vec![(base_index, base_membership)],
            delivered_index: base_index,
            applied_index: base_index,
            snapshot_index: base_index,
            removed: false,
            app_gone: false,
        }
    }

    /// run until stopped, drained, removed, or failed
    pub(crate) async fn run(mut self) -> Result<()> {
        info!(node_id = self.id, "node driver started");
        let result = match self.event_loop().await {
            Ok(()) => self.drain_in_flight().await,
            Err(e) => Err(e),
        };
        self.publisher.close();
        self.transport.shutdown();
        self.publish_status();
        match &result {
            Ok(()) => info!(node_id = self.id, applied = self.applied_index, "node stopped"),
            Err(e) => error!(node_id = self.id, error = %e, "node failed"),
        }
        result
    }

    async fn event_loop(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut drain_deadline: Option<Instant> = None;

        self.process_ready()?;
        loop {
            if self.removed {
                info!(node_id = self.id, "removed from the cluster");
                return Ok(());
            }
            if self.app_gone {
                info!(node_id = self.id, "commit receiver dropped");
                return Ok(());
            }
            if let Some(deadline) = drain_deadline {
                if self.drained() {
                    info!(node_id = self.id, "drained after proposal intake closed");
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    warn!(node_id = self.id, backlog = self.backlog.len(), "drain timed out");
                    return Ok(());
                }
            }

            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Event::Stop,
                completion = self.publisher.completion() => Event::Applied(completion),
                _ = ticker.tick() => Event::Tick,
                Some(envelope) = self.inbound.recv() => Event::Message(envelope),
                proposal = next_proposal(&mut self.proposals), if self.backlog.len() < self.backlog_limit => {
                    Event::Proposal(proposal)
                }
                Some(change) = self.membership_rx.recv() => Event::Membership(change),
            };

            match event {
                Event::Stop => {
                    info!(node_id = self.id, "stop requested");
                    return Ok(());
                }
                Event::Applied(Completion::Applied(index)) => {
                    self.applied_index = self.applied_index.max(index);
                }
                Event::Applied(Completion::Abandoned(_)) => {}
                Event::Applied(Completion::Failed { last_index, error: cause }) => {
                    error!(node_id = self.id, last_index, error = %cause, "application failed to apply batch");
                    return Err(cause.into());
                }
                Event::Tick => self.on_tick()?,
                Event::Message(envelope) => self.on_message(envelope)?,
                Event::Proposal(Some(data)) => self.on_proposal(data)?,
                Event::Proposal(None) => {
                    info!(node_id = self.id, "proposal intake closed, draining");
                    self.proposals = None;
                    drain_deadline = Some(Instant::now() + self.drain_timeout);
                }
                Event::Membership(change) => {
                    self.intents.push_back(change);
                    self.submit_intent()?;
                }
            }
            self.process_ready()?;
        }
    }

    // -- inputs --

    fn on_tick(&mut self) -> Result<()> {
        self.engine.step(EngineInput::Tick)?;
        self.flush_backlog()?;

        match self.outstanding.as_mut() {
            Some(outstanding) => {
                outstanding.ticks += 1;
                if outstanding.ticks >= self.resubmit_after {
                    outstanding.ticks = 0;
                    let change = outstanding.change.clone();
                    debug!(node_id = self.id, peer = change.node_id, "resubmitting membership change");
                    self.propose_membership(change)?;
                }
            }
            None => self.submit_intent()?,
        }
        Ok(())
    }

    fn on_message(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.to != self.id {
            debug!(node_id = self.id, to = envelope.to, "dropping misaddressed message");
            return Ok(());
        }
        self.engine.step(EngineInput::Message(envelope))?;
        Ok(())
    }

    fn on_proposal(&mut self, data: Vec<u8>) -> Result<()> {
        // later proposals may not overtake queued ones
        if !self.backlog.is_empty() {
            self.backlog.push_back(data);
            return Ok(());
        }
        match self.engine.step(EngineInput::Propose(data.clone())) {
            Ok(()) => Ok(()),
            Err(EngineError::ProposalDropped) => {
                debug!(node_id = self.id, "no leader yet, queueing proposal");
                self.backlog.push_back(data);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn flush_backlog(&mut self) -> Result<()> {
        while let Some(data) = self.backlog.front() {
            match self.engine.step(EngineInput::Propose(data.clone())) {
                Ok(()) => {
                    self.backlog.pop_front();
                }
                Err(EngineError::ProposalDropped) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// false when the engine cannot take the change right now
    fn propose_membership(&mut self, change: MembershipChange) -> Result<bool> {
        match self.engine.step(EngineInput::ProposeMembership(change)) {
            Ok(()) => Ok(true),
            Err(EngineError::ProposalDropped) | Err(EngineError::MembershipChangePending(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// hand the next queued change to the engine; one at a time
    fn submit_intent(&mut self) -> Result<()> {
        if self.outstanding.is_some() {
            return Ok(());
        }
        let Some(change) = self.intents.front().cloned() else {
            return Ok(());
        };
        if self.propose_membership(change.clone())? {
            self.intents.pop_front();
            self.outstanding = Some(Outstanding { change, ticks: 0 });
        }
        Ok(())
    }

    // -- ready handling --

    fn process_ready(&mut self) -> Result<()> {
        while let Some(ready) = self.engine.ready() {
            self.handle_ready(ready)?;
        }
        // the slot is free right after a completion, before the next batch goes out
        self.maybe_snapshot()?;
        match self.publisher.publish() {
            Ok(Some(index)) => self.applied_index = self.applied_index.max(index),
            Ok(None) => {}
            Err(PipelineClosed) => self.app_gone = true,
        }
        self.maybe_snapshot()?;
        self.publish_status();
        Ok(())
    }

    fn handle_ready(&mut self, ready: Ready) -> Result<()> {
        let Ready { snapshot, entries, hard_state, messages, committed_entries } = ready;

        if let Some(snapshot) = &snapshot {
            info!(node_id = self.id, index = snapshot.index(), "persisting snapshot from leader");
            self.snapshots.save(snapshot)?;
            self.log.record_snapshot(&snapshot.metadata)?;
        }
        self.log.append(&entries, hard_state.as_ref())?;

        self.transport.send(messages);

        if let Some(snapshot) = snapshot {
            self.install_snapshot(snapshot);
        }
        let changes = self.deliver(committed_entries)?;
        self.engine.advance();

        for (index, change) in changes {
            self.apply_membership(index, change);
        }
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) {
        let index = snapshot.index();
        let membership = snapshot.metadata.membership.clone();
        for peer in membership.descriptors() {
            self.transport.add_peer(&peer);
        }
        self.history = vec![(index, membership)];
        self.delivered_index = index;
        self.snapshot_index = index;
        self.publisher.enqueue(Vec::new(), index, Some(snapshot));
    }

    /// queue committed entries for the application; returns their membership changes
    fn deliver(&mut self, committed: Vec<LogEntry>) -> Result<Vec<(u64, MembershipChange)>> {
        let mut data = Vec::new();
        let mut changes = Vec::new();
        let mut last = None;
        for entry in committed {
            let expected = self.delivered_index + 1;
            if entry.index != expected {
                return Err(NodeError::CorruptEntry {
                    index: entry.index,
                    reason: format!("expected committed index {}", expected),
                });
            }
            self.delivered_index = entry.index;
            last = Some(entry.index);
            match entry.payload {
                EntryPayload::Command(bytes) => data.push(bytes),
                EntryPayload::Membership(change) => changes.push((entry.index, change)),
                EntryPayload::Empty => {}
            }
        }
        if let Some(last) = last {
            self.publisher.enqueue(data, last, None);
        }
        Ok(changes)
    }

    fn apply_membership(&mut self, index: u64, change: MembershipChange) {
        let current = self.engine.status().membership;
        if change.kind == ChangeKind::RemoveNode && !current.contains(change.node_id) {
            warn!(node_id = self.id, index, peer = change.node_id, "ignoring removal of unknown node");
            self.settle_outstanding(&change);
            return;
        }

        let membership = self.engine.apply_membership(&change);
        match change.kind {
            ChangeKind::AddNode => {
                self.transport.add_peer(&PeerDescriptor::new(change.node_id, change.address.clone()));
            }
            ChangeKind::RemoveNode => {
                self.transport.remove_peer(change.node_id);
                if change.node_id == self.id {
                    self.removed = true;
                }
            }
        }
        info!(
            node_id = self.id,
            index,
            kind = ?change.kind,
            peer = change.node_id,
            members = membership.len(),
            "applied membership change"
        );
        self.history.push((index, membership));
        self.settle_outstanding(&change);
    }

    fn settle_outstanding(&mut self, change: &MembershipChange) {
        if self.outstanding.as_ref().is_some_and(|o| o.change == *change) {
            self.outstanding = None;
        }
    }

    // -- snapshots --

    fn maybe_snapshot(&mut self) -> Result<()> {
        // with nothing in flight the application state is exactly applied_index
        if self.publisher.has_in_flight() {
            return Ok(());
        }
        if self.applied_index <= self.snapshot_index + self.snapshot_config.snapshot_count {
            return Ok(());
        }
        self.take_snapshot()
    }

    fn take_snapshot(&mut self) -> Result<()> {
        let index = self.applied_index;
        let term = self
            .engine
            .term_at(index)
            .ok_or_else(|| NodeError::ProtocolViolation(format!("applied index {} has no term", index)))?;
        let data = self.app.snapshot()?;
        let metadata = SnapshotMetadata { index, term, membership: self.membership_at(index) };
        let snapshot = Snapshot::new(metadata, data);

        self.snapshots.save(&snapshot)?;
        self.log.record_snapshot(&snapshot.metadata)?;
        self.engine.set_snapshot(snapshot);
        self.snapshot_index = index;
        info!(node_id = self.id, index, term, "took snapshot");

        let compact_to = index.saturating_sub(self.snapshot_config.catch_up_entries);
        if compact_to > 0 {
            self.log.compact(compact_to)?;
            self.engine.compact(compact_to)?;
            debug!(node_id = self.id, through = compact_to, "compacted log");
        }
        if let Some(keep) = self.history.iter().rposition(|(i, _)| *i <= index) {
            self.history.drain(..keep);
        }
        Ok(())
    }

    fn membership_at(&self, index: u64) -> Membership {
        self.history
            .iter()
            .rev()
            .find(|(i, _)| *i <= index)
            .map(|(_, m)| m.clone())
            .unwrap_or_default()
    }

    // -- shutdown --

    /// nothing left that the engine or the pipeline still owes
    fn drained(&self) -> bool {
        let status = self.engine.status();
        self.backlog.is_empty()
            && self.publisher.is_idle()
            && status.commit_index >= status.last_index
            && self.delivered_index >= status.commit_index
    }

    async fn drain_in_flight(&mut self) -> Result<()> {
        if !self.publisher.has_in_flight() {
            return Ok(());
        }
        match tokio::time::timeout(self.drain_timeout, self.publisher.completion()).await {
            Ok(Completion::Applied(index)) => self.applied_index = self.applied_index.max(index),
            Ok(Completion::Abandoned(_)) => {}
            Ok(Completion::Failed { error, .. }) => return Err(error.into()),
            Err(_) => warn!(node_id = self.id, "in-flight batch not acknowledged before shutdown"),
        }
        Ok(())
    }

    fn publish_status(&self) {
        let engine = self.engine.status();
        let status = NodeStatus {
            id: self.id,
            term: engine.term,
            role: engine.state,
            leader: engine.leader,
            commit_index: engine.commit_index,
            applied_index: self.applied_index,
            snapshot_index: self.snapshot_index,
            last_index: engine.last_index,
            membership: engine.membership,
            backlog: self.backlog.len(),
            unreachable: self.transport.unreachable_peers(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

async fn next_proposal(rx: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
