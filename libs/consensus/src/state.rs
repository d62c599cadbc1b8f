//! Raft node state and role management

use crate::storage::Metadata;
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The role a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Follower - accepts log entries from leader
    Follower,
    /// Candidate - attempting to become leader
    Candidate,
    /// Leader - accepts client requests and replicates log
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "Follower"),
            RaftRole::Candidate => write!(f, "Candidate"),
            RaftRole::Leader => write!(f, "Leader"),
        }
    }
}

/// Volatile state on all servers
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Index of highest log entry known to be committed
    pub commit_index: LogIndex,

    /// Index of highest log entry applied to state machine
    pub last_applied: LogIndex,
}

/// Volatile state on leaders (reinitialized after election)
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// For each server, index of next log entry to send
    pub next_index: Vec<(NodeId, LogIndex)>,

    /// For each server, index of highest log entry known to be replicated
    pub match_index: Vec<(NodeId, LogIndex)>,
}

impl LeaderState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        Self {
            next_index: peers.iter().map(|&id| (id, last_log_index + 1)).collect(),
            match_index: peers.iter().map(|&id| (id, LogIndex::ZERO)).collect(),
        }
    }

    pub fn next_index(&self, node: NodeId) -> Option<LogIndex> {
        self.next_index
            .iter()
            .find(|(id, _)| *id == node)
            .map(|(_, idx)| *idx)
    }

    pub fn set_next_index(&mut self, node: NodeId, index: LogIndex) {
        if let Some(entry) = self.next_index.iter_mut().find(|(id, _)| *id == node) {
            entry.1 = index;
        }
    }

    pub fn match_index(&self, node: NodeId) -> Option<LogIndex> {
        self.match_index
            .iter()
            .find(|(id, _)| *id == node)
            .map(|(_, idx)| *idx)
    }

    pub fn set_match_index(&mut self, node: NodeId, index: LogIndex) {
        if let Some(entry) = self.match_index.iter_mut().find(|(id, _)| *id == node) {
            entry.1 = index;
        }
    }
}

/// Candidate-specific state
#[derive(Debug, Clone)]
pub struct CandidateState {
    /// Set of nodes that have granted votes in this election (self included)
    pub votes_received: HashSet<NodeId>,
}

impl CandidateState {
    pub fn new(me: NodeId) -> Self {
        let mut votes_received = HashSet::new();
        votes_received.insert(me);
        Self { votes_received }
    }

    pub fn add_vote(&mut self, node: NodeId) {
        self.votes_received.insert(node);
    }

    pub fn has_majority(&self, cluster_size: usize) -> bool {
        self.votes_received.len() * 2 > cluster_size
    }
}

/// Complete Raft node state
///
/// All of it lives behind a single lock that is only ever taken for short,
/// I/O-free critical sections.
#[derive(Debug)]
pub struct NodeState {
    /// Current role of this node
    pub role: RaftRole,

    /// This node's ID
    pub id: NodeId,

    /// Current leader, as last observed (advisory, for client redirection)
    pub leader_id: Option<NodeId>,

    /// Voting state mirrored to stable storage
    pub persistent: Metadata,

    /// Volatile state
    pub volatile: VolatileState,

    /// Leader-specific state (only valid when role == Leader)
    pub leader_state: Option<LeaderState>,

    /// Candidate-specific state (only valid when role == Candidate)
    pub candidate_state: Option<CandidateState>,

    /// All nodes in the cluster (including self)
    pub peers: Vec<NodeId>,
}

impl NodeState {
    pub fn new(id: NodeId, peers: Vec<NodeId>, persistent: Metadata) -> Self {
        Self {
            role: RaftRole::Follower,
            id,
            leader_id: None,
            persistent,
            volatile: VolatileState::default(),
            leader_state: None,
            candidate_state: None,
            peers,
        }
    }

    /// Transition to follower state
    ///
    /// A term increase invalidates any vote cast in the old term.
    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.persistent.current_term {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.leader_id = leader;
        self.leader_state = None;
        self.candidate_state = None;
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self) {
        self.role = RaftRole::Candidate;
        self.persistent.current_term.increment();
        self.persistent.voted_for = Some(self.id);
        self.leader_id = None;
        self.candidate_state = Some(CandidateState::new(self.id));
        self.leader_state = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);

        let other_peers = self.other_peers();
        self.leader_state = Some(LeaderState::new(&other_peers, last_log_index));
        self.candidate_state = None;
    }

    /// Get other peers (excluding self)
    pub fn other_peers(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|&&p| p != self.id)
            .copied()
            .collect()
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(id: u64) -> NodeState {
        NodeState::new(
            NodeId(id),
            vec![NodeId(1), NodeId(2), NodeId(3)],
            Metadata::default(),
        )
    }

    #[test]
    fn test_state_transitions() {
        let mut state = fresh(1);

        assert_eq!(state.role, RaftRole::Follower);

        // Become candidate
        state.become_candidate();
        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.persistent.current_term, Term(1));
        assert_eq!(state.persistent.voted_for, Some(NodeId(1)));
        assert!(state.candidate_state.is_some());

        // Become leader
        state.become_leader(LogIndex(10));
        assert_eq!(state.role, RaftRole::Leader);
        assert!(state.leader_state.is_some());
        assert!(state.candidate_state.is_none());

        // Become follower in a higher term
        state.become_follower(Term(2), Some(NodeId(2)));
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.persistent.current_term, Term(2));
        assert_eq!(state.leader_id, Some(NodeId(2)));
        assert!(state.leader_state.is_none());
    }

    #[test]
    fn test_vote_cleared_only_on_term_change() {
        let mut state = fresh(1);
        state.become_candidate();
        assert_eq!(state.persistent.voted_for, Some(NodeId(1)));

        // Same-term fallback (candidate saw a leader) keeps the vote
        state.become_follower(Term(1), Some(NodeId(2)));
        assert_eq!(state.persistent.voted_for, Some(NodeId(1)));

        // A higher term clears it
        state.become_follower(Term(5), None);
        assert_eq!(state.persistent.voted_for, None);
    }

    #[test]
    fn test_candidate_voting() {
        let mut candidate = CandidateState::new(NodeId(1));

        // Own vote alone is not a majority of 3
        assert!(!candidate.has_majority(3));

        candidate.add_vote(NodeId(2));
        assert!(candidate.has_majority(3));

        // 5-node cluster: self + 1 vote is not a majority
        assert!(!candidate.has_majority(5));
        candidate.add_vote(NodeId(3));
        assert!(candidate.has_majority(5));
    }

    #[test]
    fn test_leader_state() {
        let peers = vec![NodeId(2), NodeId(3)];
        let mut leader = LeaderState::new(&peers, LogIndex(10));

        // Initial state
        assert_eq!(leader.next_index(NodeId(2)), Some(LogIndex(11)));
        assert_eq!(leader.match_index(NodeId(2)), Some(LogIndex::ZERO));

        // Update state
        leader.set_next_index(NodeId(2), LogIndex(15));
        leader.set_match_index(NodeId(2), LogIndex(14));

        assert_eq!(leader.next_index(NodeId(2)), Some(LogIndex(15)));
        assert_eq!(leader.match_index(NodeId(2)), Some(LogIndex(14)));
    }
}
