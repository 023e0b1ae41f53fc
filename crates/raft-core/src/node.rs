//! # node
//!
//! why: run the raft election and replication rules for one member
//! relations: uses message.rs for rpc types, log.rs for entries; wrapped by engine.rs
//! what: NodeState, RaftConfig, RaftNode with tick/step/propose and ready bookkeeping

use crate::engine::EngineError;
use crate::log::{EntryPayload, HardState, LogEntry, Membership, MembershipChange, NodeId, Snapshot};
use crate::message::{Envelope, RaftMessage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// The roles a Raft node moves between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// probing peers before bumping the term
    PreCandidate,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// timing knobs, all measured in ticks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
    pub pre_vote: bool,
    /// cap on entries carried by a single AppendEntries
    pub max_entries_per_message: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 10,
            election_timeout_max: 20,
            heartbeat_interval: 1,
            pre_vote: true,
            max_entries_per_message: 256,
        }
    }
}

/// what a restarted node hands back to the engine
#[derive(Debug, Clone, Default)]
pub struct RestoreState {
    pub snapshot: Option<Snapshot>,
    pub hard_state: HardState,
    /// index and term of the entry just below `entries`
    pub base_index: u64,
    pub base_term: u64,
    pub entries: Vec<LogEntry>,
}

/// what the last ready() handed out, settled by advance()
#[derive(Debug, Clone, Copy)]
pub(crate) struct Handed {
    pub last_entry: Option<u64>,
    pub hard_state: HardState,
    pub applied_to: u64,
    pub snapshot: bool,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    pub id: NodeId,
    pub state: NodeState,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    /// retained entries; the first one has index `compacted_index + 1`
    pub log: Vec<LogEntry>,
    pub compacted_index: u64,
    pub compacted_term: u64,
    pub commit_index: u64,
    /// highest index handed out as committed
    pub last_applied: u64,
    pub membership: Membership,
    pub votes_received: Vec<NodeId>,
    pub next_index: HashMap<NodeId, u64>,
    pub match_index: HashMap<NodeId, u64>,
    pub config: RaftConfig,
    /// newest local snapshot, shipped to peers behind the compaction point
    pub snapshot: Option<Snapshot>,
    pub(crate) pending_snapshot: Option<Snapshot>,
    pub(crate) pending_conf_index: u64,
    pub(crate) election_elapsed: u64,
    pub(crate) heartbeat_elapsed: u64,
    pub(crate) randomized_timeout: u64,
    pub(crate) outbox: Vec<Envelope>,
    pub(crate) stable_index: u64,
    pub(crate) persisted: HardState,
    pub(crate) handed: Option<Handed>,
}

impl RaftNode {
    /// Create a follower that already knows its peer set
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Self {
        Self::with_config(id, peers, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, peers: Vec<NodeId>, config: RaftConfig) -> Self {
        let mut node = Self::blank(id, config);
        for peer in peers {
            node.membership.insert(peer, String::new());
        }
        node
    }

    /// a node with no log and no peers, as used when joining a running cluster
    pub fn blank(id: NodeId, config: RaftConfig) -> Self {
        let mut node = Self {
            id,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            log: Vec::new(),
            compacted_index: 0,
            compacted_term: 0,
            commit_index: 0,
            last_applied: 0,
            membership: Membership::new(),
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            config,
            snapshot: None,
            pending_snapshot: None,
            pending_conf_index: 0,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_timeout: 0,
            outbox: Vec::new(),
            stable_index: 0,
            persisted: HardState::default(),
            handed: None,
        };
        node.reset_election_timer();
        node
    }

    /// fresh cluster: one committed AddNode entry per initial member at term 1
    ///
    /// the peer set itself is then learned by applying those entries, so a
    /// member that joins later replays the same history
    pub fn bootstrap(id: NodeId, mut peers: Vec<(NodeId, String)>, config: RaftConfig) -> Self {
        peers.sort_by_key(|(peer, _)| *peer);
        let mut node = Self::blank(id, config);
        node.current_term = 1;
        for (i, (peer, address)) in peers.into_iter().enumerate() {
            let index = i as u64 + 1;
            node.log.push(LogEntry::membership(1, index, MembershipChange::add(peer, address)));
        }
        node.commit_index = node.last_log_index();
        node
    }

    /// rebuild a node from what the durable stores hold
    pub fn restore(id: NodeId, config: RaftConfig, state: RestoreState) -> Result<Self, EngineError> {
        let mut node = Self::blank(id, config);
        let snapshot_index = state.snapshot.as_ref().map_or(0, Snapshot::index);
        if state.base_index > snapshot_index {
            return Err(EngineError::InconsistentState(format!(
                "log compacted through {} beyond snapshot {}",
                state.base_index, snapshot_index
            )));
        }
        for (offset, entry) in state.entries.iter().enumerate() {
            let expected = state.base_index + offset as u64 + 1;
            if entry.index != expected {
                return Err(EngineError::InconsistentState(format!(
                    "log gap: expected index {}, found {}",
                    expected, entry.index
                )));
            }
        }
        let last = state.base_index + state.entries.len() as u64;
        if last < snapshot_index {
            return Err(EngineError::InconsistentState(format!(
                "log ends at {} below snapshot {}",
                last, snapshot_index
            )));
        }

        node.compacted_index = state.base_index;
        node.compacted_term = state.base_term;
        node.log = state.entries;
        node.stable_index = last;
        node.current_term = state.hard_state.term;
        node.voted_for = state.hard_state.voted_for;
        node.commit_index = state.hard_state.commit.max(snapshot_index).min(last);
        node.last_applied = snapshot_index;
        if let Some(snapshot) = state.snapshot {
            node.current_term = node.current_term.max(snapshot.metadata.term);
            node.membership = snapshot.metadata.membership.clone();
            node.snapshot = Some(snapshot);
        }
        node.persisted = node.hard_state();
        Ok(node)
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.last().map_or(self.compacted_index, |e| e.index)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map_or(self.compacted_term, |e| e.term)
    }

    /// term of the entry at `index`, None once compacted away or past the end
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.compacted_index {
            return Some(self.compacted_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.compacted_index {
            return None;
        }
        self.log.get((index - self.compacted_index - 1) as usize)
    }

    fn slice(&self, lo: u64, hi: u64) -> &[LogEntry] {
        let start = (lo.max(self.compacted_index + 1) - self.compacted_index - 1) as usize;
        let end = ((hi.min(self.last_log_index()) + 1).saturating_sub(self.compacted_index + 1)) as usize;
        if start >= end {
            return &[];
        }
        &self.log[start..end]
    }

    pub fn hard_state(&self) -> HardState {
        HardState { term: self.current_term, voted_for: self.voted_for, commit: self.commit_index }
    }

    // -- quorum --

    pub fn quorum_size(&self) -> usize {
        self.membership.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        let votes = self.votes_received.iter().filter(|id| self.membership.contains(**id)).count();
        votes >= self.quorum_size()
    }

    fn promotable(&self) -> bool {
        self.membership.contains(self.id)
    }

    fn peers(&self) -> Vec<NodeId> {
        self.membership.ids().into_iter().filter(|p| *p != self.id).collect()
    }

    fn send(&mut self, to: NodeId, message: RaftMessage) {
        self.outbox.push(Envelope::new(self.id, to, message));
    }

    // -- timers --

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        let min = self.config.election_timeout_min.max(1);
        let max = self.config.election_timeout_max.max(min);
        self.randomized_timeout = rand::thread_rng().gen_range(min..=max);
    }

    /// leader known and heard from recently enough to refuse pre-votes
    fn in_lease(&self) -> bool {
        self.leader_id.is_some() && self.election_elapsed < self.config.election_timeout_min
    }

    pub fn tick(&mut self) {
        if self.state == NodeState::Leader {
            self.heartbeat_elapsed += 1;
            if self.heartbeat_elapsed >= self.config.heartbeat_interval {
                self.heartbeat_elapsed = 0;
                self.broadcast_append();
            }
            return;
        }
        self.election_elapsed += 1;
        if self.promotable() && self.election_elapsed >= self.randomized_timeout {
            self.campaign();
        }
    }

    // -- elections --

    pub fn campaign(&mut self) {
        if !self.config.pre_vote {
            self.start_election();
            return;
        }
        self.state = NodeState::PreCandidate;
        self.leader_id = None;
        self.votes_received = vec![self.id];
        self.reset_election_timer();
        if self.has_quorum() {
            self.start_election();
            return;
        }
        debug!(node = self.id, term = self.current_term + 1, "starting pre-vote");
        let (last_log_index, last_log_term) = (self.last_log_index(), self.last_log_term());
        for peer in self.peers() {
            self.send(
                peer,
                RaftMessage::PreVoteRequest {
                    term: self.current_term + 1,
                    candidate_id: self.id,
                    last_log_index,
                    last_log_term,
                },
            );
        }
    }

    /// bump the term, vote for self and ask peers for votes
    pub fn start_election(&mut self) {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes_received = vec![self.id];
        self.reset_election_timer();
        info!(node = self.id, term = self.current_term, "starting election");
        if self.has_quorum() {
            self.become_leader();
            return;
        }
        let (last_log_index, last_log_term) = (self.last_log_index(), self.last_log_term());
        for peer in self.peers() {
            self.send(
                peer,
                RaftMessage::VoteRequest {
                    term: self.current_term,
                    candidate_id: self.id,
                    last_log_index,
                    last_log_term,
                },
            );
        }
    }

    pub fn become_follower(&mut self, term: u64, leader: Option<NodeId>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        if self.state == NodeState::Leader {
            info!(node = self.id, term, "stepping down");
        }
        self.state = NodeState::Follower;
        self.leader_id = leader;
        self.votes_received.clear();
        self.reset_election_timer();
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();
        self.heartbeat_elapsed = 0;
        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.peers() {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
        // earlier membership entries may still be unapplied
        self.pending_conf_index = self.last_log_index();
        info!(node = self.id, term = self.current_term, "became leader");
        self.append_payload(EntryPayload::Empty);
        self.broadcast_append();
        self.maybe_commit();
    }

    fn log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        last_log_term > self.last_log_term()
            || (last_log_term == self.last_log_term() && last_log_index >= self.last_log_index())
    }

    fn handle_pre_vote_request(&mut self, term: u64, candidate: NodeId, lli: u64, llt: u64) {
        let granted = !self.in_lease() && self.log_up_to_date(lli, llt);
        let reply_term = if granted { term } else { self.current_term };
        self.send(candidate, RaftMessage::PreVoteResponse { term: reply_term, vote_granted: granted });
    }

    fn handle_pre_vote_response(&mut self, from: NodeId, term: u64, granted: bool) {
        if self.state != NodeState::PreCandidate || term != self.current_term + 1 || !granted {
            return;
        }
        if !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.start_election();
        }
    }

    fn handle_vote_request(&mut self, candidate: NodeId, lli: u64, llt: u64) {
        let free = matches!(self.voted_for, None) || self.voted_for == Some(candidate);
        let free = free && self.leader_id.is_none();
        let granted = free && self.log_up_to_date(lli, llt);
        if granted {
            self.voted_for = Some(candidate);
            self.election_elapsed = 0;
        }
        self.send(candidate, RaftMessage::VoteResponse { term: self.current_term, vote_granted: granted });
    }

    fn handle_vote_response(&mut self, from: NodeId, granted: bool) {
        if self.state != NodeState::Candidate || !granted {
            return;
        }
        if !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
        }
    }

    // -- replication --

    fn append_payload(&mut self, payload: EntryPayload) -> u64 {
        let index = self.last_log_index() + 1;
        self.log.push(LogEntry { term: self.current_term, index, payload });
        index
    }

    /// leader-side append of an application command
    pub fn append_entry(&mut self, command: Vec<u8>) -> LogEntry {
        let entry = LogEntry::new(self.current_term, self.last_log_index() + 1, command);
        self.log.push(entry.clone());
        entry
    }

    fn broadcast_append(&mut self) {
        for peer in self.peers() {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, to: NodeId) {
        let last = self.last_log_index();
        let next = *self.next_index.entry(to).or_insert(last + 1);
        let prev = next - 1;
        let Some(prev_term) = self.term_at(prev) else {
            self.send_snapshot(to);
            return;
        };
        let hi = last.min(next + self.config.max_entries_per_message as u64 - 1);
        let entries = self.slice(next, hi).to_vec();
        if let Some(sent) = entries.last() {
            self.next_index.insert(to, sent.index + 1);
        }
        self.send(
            to,
            RaftMessage::AppendEntries {
                term: self.current_term,
                leader_id: self.id,
                prev_log_index: prev,
                prev_log_term: prev_term,
                entries,
                leader_commit: self.commit_index,
            },
        );
    }

    fn send_snapshot(&mut self, to: NodeId) {
        let Some(snapshot) = self.snapshot.clone() else {
            warn!(node = self.id, peer = to, "peer needs compacted entries but no snapshot is held");
            return;
        };
        debug!(node = self.id, peer = to, index = snapshot.index(), "sending snapshot");
        self.next_index.insert(to, snapshot.index() + 1);
        self.send(to, RaftMessage::InstallSnapshot { term: self.current_term, leader_id: self.id, snapshot });
    }

    fn handle_append_entries(
        &mut self,
        leader: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) {
        self.become_follower(self.current_term, Some(leader));
        let term = self.current_term;
        if prev_log_index < self.commit_index {
            let match_index = self.commit_index;
            self.send(leader, RaftMessage::AppendEntriesResponse { term, success: true, match_index });
            return;
        }
        if self.term_at(prev_log_index) != Some(prev_log_term) {
            let hint = prev_log_index.saturating_sub(1).min(self.last_log_index());
            debug!(node = self.id, prev_log_index, hint, "rejecting append");
            self.send(leader, RaftMessage::AppendEntriesResponse { term, success: false, match_index: hint });
            return;
        }
        let last_new = prev_log_index + entries.len() as u64;
        for entry in entries {
            match self.term_at(entry.index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    // prev_log_index >= commit_index here, so only uncommitted entries are cut
                    self.log.truncate((entry.index - self.compacted_index - 1) as usize);
                    self.stable_index = self.stable_index.min(entry.index - 1);
                    self.log.push(entry);
                }
                None => self.log.push(entry),
            }
        }
        let commit = leader_commit.min(last_new);
        if commit > self.commit_index {
            self.commit_index = commit;
        }
        self.send(leader, RaftMessage::AppendEntriesResponse { term, success: true, match_index: last_new });
    }

    fn handle_append_response(&mut self, from: NodeId, success: bool, match_index: u64) {
        if self.state != NodeState::Leader || !self.membership.contains(from) {
            return;
        }
        let matched = self.match_index.get(&from).copied().unwrap_or(0);
        let next = self.next_index.get(&from).copied().unwrap_or(self.last_log_index() + 1);
        if success {
            if match_index > matched {
                self.match_index.insert(from, match_index);
                self.next_index.insert(from, next.max(match_index + 1));
                if self.maybe_commit() {
                    self.broadcast_append();
                    return;
                }
            }
            if self.next_index.get(&from).copied().unwrap_or(0) <= self.last_log_index() {
                self.send_append(from);
            }
        } else {
            let backed_off = (matched + 1).max(next.saturating_sub(1).min(match_index + 1));
            self.next_index.insert(from, backed_off);
            self.send_append(from);
        }
    }

    /// advance commit to the highest current-term index held by a quorum
    pub fn maybe_commit(&mut self) -> bool {
        if self.state != NodeState::Leader || self.membership.is_empty() {
            return false;
        }
        let last = self.last_log_index();
        let mut matched: Vec<u64> = self
            .membership
            .ids()
            .into_iter()
            .map(|id| if id == self.id { last } else { self.match_index.get(&id).copied().unwrap_or(0) })
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.quorum_size() - 1];
        if candidate > self.commit_index && self.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            debug!(node = self.id, commit = candidate, "commit advanced");
            return true;
        }
        false
    }

    fn handle_install_snapshot(&mut self, leader: NodeId, snapshot: Snapshot) {
        self.become_follower(self.current_term, Some(leader));
        let term = self.current_term;
        let index = snapshot.index();
        if index <= self.commit_index {
            let match_index = self.commit_index;
            self.send(leader, RaftMessage::AppendEntriesResponse { term, success: true, match_index });
            return;
        }
        if self.term_at(index) == Some(snapshot.metadata.term) {
            self.commit_index = index;
        } else {
            info!(node = self.id, index, "installing snapshot");
            self.log.clear();
            self.compacted_index = index;
            self.compacted_term = snapshot.metadata.term;
            self.commit_index = index;
            self.last_applied = index;
            self.stable_index = index;
            self.membership = snapshot.metadata.membership.clone();
            self.snapshot = Some(snapshot.clone());
            self.pending_snapshot = Some(snapshot);
        }
        self.send(leader, RaftMessage::AppendEntriesResponse { term, success: true, match_index: index });
    }

    // -- inputs --

    /// propose a payload; a follower forwards it to the leader it knows
    pub fn propose(&mut self, payload: EntryPayload) -> Result<u64, EngineError> {
        match self.state {
            NodeState::Leader => {
                let membership = matches!(payload, EntryPayload::Membership(_));
                if membership && self.pending_conf_index > self.last_applied {
                    return Err(EngineError::MembershipChangePending(self.pending_conf_index));
                }
                let index = self.append_payload(payload);
                if membership {
                    self.pending_conf_index = index;
                }
                self.broadcast_append();
                self.maybe_commit();
                Ok(index)
            }
            _ => match self.leader_id {
                Some(leader) if leader != self.id => {
                    self.send(leader, RaftMessage::Propose { entries: vec![payload] });
                    Ok(0)
                }
                _ => Err(EngineError::ProposalDropped),
            },
        }
    }

    /// feed one inbound message through the term rules and its handler
    pub fn handle_message(&mut self, envelope: Envelope) {
        let Envelope { from, message, .. } = envelope;
        if let Some(term) = message.term() {
            if term > self.current_term {
                match &message {
                    RaftMessage::PreVoteRequest { .. } | RaftMessage::PreVoteResponse { vote_granted: true, .. } => {}
                    RaftMessage::AppendEntries { .. } | RaftMessage::InstallSnapshot { .. } => {
                        self.become_follower(term, Some(from))
                    }
                    _ => self.become_follower(term, None),
                }
            } else if term < self.current_term {
                let current = self.current_term;
                match message {
                    RaftMessage::AppendEntries { .. } | RaftMessage::InstallSnapshot { .. } => self.send(
                        from,
                        RaftMessage::AppendEntriesResponse { term: current, success: false, match_index: 0 },
                    ),
                    RaftMessage::PreVoteRequest { .. } => {
                        self.send(from, RaftMessage::PreVoteResponse { term: current, vote_granted: false })
                    }
                    RaftMessage::VoteRequest { .. } => {
                        self.send(from, RaftMessage::VoteResponse { term: current, vote_granted: false })
                    }
                    _ => {}
                }
                return;
            }
        }

        match message {
            RaftMessage::PreVoteRequest { term, candidate_id, last_log_index, last_log_term } => {
                self.handle_pre_vote_request(term, candidate_id, last_log_index, last_log_term)
            }
            RaftMessage::PreVoteResponse { term, vote_granted } => {
                self.handle_pre_vote_response(from, term, vote_granted)
            }
            RaftMessage::VoteRequest { candidate_id, last_log_index, last_log_term, .. } => {
                self.handle_vote_request(candidate_id, last_log_index, last_log_term)
            }
            RaftMessage::VoteResponse { vote_granted, .. } => self.handle_vote_response(from, vote_granted),
            RaftMessage::AppendEntries { leader_id, prev_log_index, prev_log_term, entries, leader_commit, .. } => {
                self.handle_append_entries(leader_id, prev_log_index, prev_log_term, entries, leader_commit)
            }
            RaftMessage::AppendEntriesResponse { success, match_index, .. } => {
                self.handle_append_response(from, success, match_index)
            }
            RaftMessage::InstallSnapshot { leader_id, snapshot, .. } => self.handle_install_snapshot(leader_id, snapshot),
            RaftMessage::Propose { entries } => {
                for payload in entries {
                    if let Err(e) = self.propose(payload) {
                        debug!(node = self.id, from, error = %e, "dropping forwarded proposal");
                    }
                }
            }
        }
    }

    // -- membership and compaction --

    /// fold an applied membership change into the peer set and leader progress
    pub fn apply_membership(&mut self, change: &MembershipChange) -> Membership {
        self.membership.apply(change);
        if self.state == NodeState::Leader && change.node_id != self.id {
            let last = self.last_log_index();
            if self.membership.contains(change.node_id) {
                self.next_index.entry(change.node_id).or_insert(last + 1);
                self.match_index.entry(change.node_id).or_insert(0);
            } else {
                self.next_index.remove(&change.node_id);
                self.match_index.remove(&change.node_id);
                if self.maybe_commit() {
                    self.broadcast_append();
                }
            }
        }
        self.membership.clone()
    }

    /// drop retained entries at or below `through`
    pub fn compact(&mut self, through: u64) -> Result<(), EngineError> {
        if through > self.last_applied {
            return Err(EngineError::CompactBeyondApplied { through, applied: self.last_applied });
        }
        if through <= self.compacted_index {
            return Ok(());
        }
        let term = self.term_at(through).unwrap_or(self.compacted_term);
        self.log.drain(..(through - self.compacted_index) as usize);
        self.compacted_index = through;
        self.compacted_term = term;
        Ok(())
    }
}
