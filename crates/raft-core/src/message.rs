//! # message
//!
//! why: everything one raft node says to another, as one serializable enum
//! relations: produced and consumed by node.rs, framed over tcp by raft-node
//! what: vote, pre-vote, append, snapshot and proposal-forward messages

use crate::log::{EntryPayload, LogEntry, NodeId, Snapshot};
use serde::{Deserialize, Serialize};

/// a raft rpc or reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// probe whether an election could succeed, without bumping terms
    PreVoteRequest {
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    PreVoteResponse {
        term: u64,
        vote_granted: bool,
    },
    /// ask for a vote in a new term
    VoteRequest {
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    VoteResponse {
        term: u64,
        vote_granted: bool,
    },
    /// replicate entries; with none it is a heartbeat
    AppendEntries {
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    /// match_index is the last replicated index on success, a back-off hint on failure
    AppendEntriesResponse {
        term: u64,
        success: bool,
        match_index: u64,
    },
    /// full state transfer for a follower behind the compaction point
    InstallSnapshot {
        term: u64,
        leader_id: NodeId,
        snapshot: Snapshot,
    },
    /// proposals forwarded from a follower to the leader
    Propose {
        entries: Vec<EntryPayload>,
    },
}

impl RaftMessage {
    /// term carried by the message; forwarded proposals carry none
    pub fn term(&self) -> Option<u64> {
        match self {
            RaftMessage::PreVoteRequest { term, .. }
            | RaftMessage::PreVoteResponse { term, .. }
            | RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. } => Some(*term),
            RaftMessage::Propose { .. } => None,
        }
    }
}

/// a message addressed between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}

impl Envelope {
    pub fn new(from: NodeId, to: NodeId, message: RaftMessage) -> Self {
        Self { from, to, message }
    }
}
