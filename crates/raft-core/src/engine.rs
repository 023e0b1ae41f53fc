//! # engine
//!
//! why: give the node driver a narrow step/ready/advance view of consensus
//! relations: implemented by node.rs, driven by raft-node's driver
//! what: ConsensusEngine trait, EngineInput, Ready, EngineStatus, EngineError

use crate::log::{EntryPayload, HardState, LogEntry, Membership, MembershipChange, NodeId, Snapshot};
use crate::message::Envelope;
use crate::node::{Handed, NodeState, RaftNode};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// no leader is known to take the proposal
    #[error("proposal dropped: no known leader")]
    ProposalDropped,

    #[error("membership change at index {0} is not applied yet")]
    MembershipChangePending(u64),

    #[error("cannot compact through {through}: only {applied} applied")]
    CompactBeyondApplied { through: u64, applied: u64 },

    #[error("inconsistent state: {0}")]
    InconsistentState(String),
}

/// one unit of outside input for the engine
#[derive(Debug, Clone)]
pub enum EngineInput {
    Tick,
    Propose(Vec<u8>),
    ProposeMembership(MembershipChange),
    Message(Envelope),
}

/// side effects produced since the last advance
///
/// handle in field order: persist `snapshot`, then `entries` with
/// `hard_state`, then send `messages`, then deliver `committed_entries`
#[derive(Debug, Clone, Default)]
pub struct Ready {
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<LogEntry>,
    pub hard_state: Option<HardState>,
    pub messages: Vec<Envelope>,
    pub committed_entries: Vec<LogEntry>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none()
            && self.entries.is_empty()
            && self.hard_state.is_none()
            && self.messages.is_empty()
            && self.committed_entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub id: NodeId,
    pub term: u64,
    pub state: NodeState,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub last_index: u64,
    pub compacted_index: u64,
    pub membership: Membership,
}

/// a consensus algorithm as seen from the node driver
pub trait ConsensusEngine: Send {
    fn step(&mut self, input: EngineInput) -> Result<(), EngineError>;

    /// pending side effects, or None when there is nothing to do
    fn ready(&mut self) -> Option<Ready>;

    /// the last ready has been fully handled
    fn advance(&mut self);

    /// apply a committed, delivered membership change; returns the new peer set
    fn apply_membership(&mut self, change: &MembershipChange) -> Membership;

    /// record a snapshot taken locally so lagging peers can be sent it
    fn set_snapshot(&mut self, snapshot: Snapshot);

    fn compact(&mut self, through: u64) -> Result<(), EngineError>;

    fn term_at(&self, index: u64) -> Option<u64>;

    fn status(&self) -> EngineStatus;
}

impl RaftNode {
    fn has_ready(&self) -> bool {
        self.pending_snapshot.is_some()
            || self.last_log_index() > self.stable_index
            || self.hard_state() != self.persisted
            || !self.outbox.is_empty()
            || self.commit_index > self.last_applied
    }
}

impl ConsensusEngine for RaftNode {
    fn step(&mut self, input: EngineInput) -> Result<(), EngineError> {
        match input {
            EngineInput::Tick => {
                self.tick();
                Ok(())
            }
            EngineInput::Propose(data) => self.propose(EntryPayload::Command(data)).map(|_| ()),
            EngineInput::ProposeMembership(change) => self.propose(EntryPayload::Membership(change)).map(|_| ()),
            EngineInput::Message(envelope) => {
                self.handle_message(envelope);
                Ok(())
            }
        }
    }

    fn ready(&mut self) -> Option<Ready> {
        if !self.has_ready() {
            return None;
        }
        let entries: Vec<LogEntry> = self.log.iter().filter(|e| e.index > self.stable_index).cloned().collect();
        let hard_state = self.hard_state();
        let committed_entries: Vec<LogEntry> = self
            .log
            .iter()
            .filter(|e| e.index > self.last_applied && e.index <= self.commit_index)
            .cloned()
            .collect();
        self.handed = Some(Handed {
            last_entry: entries.last().map(|e| e.index),
            hard_state,
            applied_to: self.commit_index,
            snapshot: self.pending_snapshot.is_some(),
        });
        Some(Ready {
            snapshot: self.pending_snapshot.clone(),
            entries,
            hard_state: (hard_state != self.persisted).then_some(hard_state),
            messages: std::mem::take(&mut self.outbox),
            committed_entries,
        })
    }

    fn advance(&mut self) {
        let Some(handed) = self.handed.take() else {
            return;
        };
        if let Some(last) = handed.last_entry {
            self.stable_index = self.stable_index.max(last);
        }
        self.persisted = handed.hard_state;
        self.last_applied = self.last_applied.max(handed.applied_to);
        if handed.snapshot {
            self.pending_snapshot = None;
        }
    }

    fn apply_membership(&mut self, change: &MembershipChange) -> Membership {
        RaftNode::apply_membership(self, change)
    }

    fn set_snapshot(&mut self, snapshot: Snapshot) {
        if self.snapshot.as_ref().map_or(true, |s| s.index() < snapshot.index()) {
            self.snapshot = Some(snapshot);
        }
    }

    fn compact(&mut self, through: u64) -> Result<(), EngineError> {
        RaftNode::compact(self, through)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        RaftNode::term_at(self, index)
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            id: self.id,
            term: self.current_term,
            state: self.state,
            leader: self.leader_id,
            commit_index: self.commit_index,
            applied_index: self.last_applied,
            last_index: self.last_log_index(),
            compacted_index: self.compacted_index,
            membership: self.membership.clone(),
        }
    }
}
