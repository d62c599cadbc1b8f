//! Core Raft node implementation
//!
//! A node runs as a single event loop that owns all mutable Raft state.
//! Inbound RPCs, client proposals, timer expirations and outbound-RPC
//! completions all arrive as messages on one channel, so no lock is ever
//! held across I/O: outbound RPCs run in spawned tasks that post their
//! results back into the loop.

use crate::config::RaftConfig;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::state::{NodeState, RaftRole};
use crate::storage::{RaftLog, Storage};
use crate::transport::RaftTransport;
use crate::types::{Entry, LogIndex, NodeId, Term};
use crate::{RaftError, Result};

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Trait for state machines that can be replicated via Raft
///
/// Implement this trait to build a distributed application on top of Raft.
/// `apply` is called in log order with each committed command and must be
/// deterministic: no clocks, no randomness, no environment reads.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed command and return its result bytes
    fn apply(&mut self, command: &[u8]) -> Vec<u8>;
}

/// Outcome of a successful proposal: the log index the command landed at
/// and the state machine's output for it.
#[derive(Debug, Clone)]
pub struct Applied {
    pub index: LogIndex,
    pub response: Vec<u8>,
}

/// Messages processed by the node's event loop
enum RaftCommand {
    /// Propose a new command (only works on leader)
    Propose {
        command: Vec<u8>,
        client_id: String,
        request_seq: u64,
        reply: oneshot::Sender<Result<Applied>>,
    },

    /// Handle RequestVote RPC
    RequestVote {
        request: RequestVoteRequest,
        reply: oneshot::Sender<RequestVoteResponse>,
    },

    /// Handle AppendEntries RPC
    AppendEntries {
        request: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },

    /// A RequestVote RPC we sent came back
    VoteReply {
        from: NodeId,
        sent_term: Term,
        response: RequestVoteResponse,
    },

    /// An AppendEntries RPC we sent came back
    AppendReply {
        from: NodeId,
        sent_term: Term,
        prev_index: LogIndex,
        sent: u64,
        response: AppendEntriesResponse,
    },

    /// An outbound RPC to this peer failed or timed out
    PeerUnreachable { peer: NodeId },

    /// Shutdown the node
    Shutdown,
}

/// Handle to a running Raft node
///
/// Cheap to clone; all clones feed the same event loop.
pub struct RaftNode {
    id: NodeId,
    command_tx: mpsc::UnboundedSender<RaftCommand>,
    state: Arc<RwLock<NodeState>>,
}

impl Clone for RaftNode {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            command_tx: self.command_tx.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl RaftNode {
    /// Create a new Raft node and spawn its event loop
    ///
    /// `peers` is the full cluster membership including this node.
    /// The state machine is shared: the caller keeps a handle for serving
    /// reads while the apply path writes through the same lock.
    pub async fn new<SM: StateMachine>(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        storage: Box<dyn Storage>,
        state_machine: Arc<RwLock<SM>>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Self> {
        let log = RaftLog::new(storage);
        let meta = log.meta();
        let state = Arc::new(RwLock::new(NodeState::new(id, peers, meta)));

        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let inner = NodeInner {
            id,
            config,
            state: Arc::clone(&state),
            log,
            state_machine,
            transport,
            command_tx: command_tx.clone(),
            waiters: BTreeMap::new(),
            inflight: HashSet::new(),
        };

        tokio::spawn(run_node(inner, command_rx));

        Ok(RaftNode {
            id,
            command_tx,
            state,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> RaftRole {
        self.state.read().role
    }

    pub fn is_leader(&self) -> bool {
        self.state.read().role == RaftRole::Leader
    }

    /// The most recently observed leader, for client redirection (advisory)
    pub fn leader_hint(&self) -> Option<NodeId> {
        self.state.read().leader_id
    }

    pub fn current_term(&self) -> Term {
        self.state.read().persistent.current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.read().volatile.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.read().volatile.last_applied
    }

    /// Propose a command to the cluster
    ///
    /// Returns once the command has been committed and applied, with the
    /// state machine's output. Fails with `NotLeader` on followers and
    /// `LeadershipLost` if leadership changes before commit.
    pub async fn propose(
        &self,
        command: Vec<u8>,
        client_id: impl Into<String>,
        request_seq: u64,
    ) -> Result<Applied> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Propose {
                command,
                client_id: client_id.into(),
                request_seq,
                reply: tx,
            })
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Handle RequestVote RPC
    pub async fn request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::RequestVote {
                request,
                reply: tx,
            })
            .is_err()
        {
            // Node is shutting down, reject vote
            return RequestVoteResponse {
                term: Term(0),
                vote_granted: false,
            };
        }

        rx.await.unwrap_or(RequestVoteResponse {
            term: Term(0),
            vote_granted: false,
        })
    }

    /// Handle AppendEntries RPC
    pub async fn append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::AppendEntries {
                request,
                reply: tx,
            })
            .is_err()
        {
            return AppendEntriesResponse {
                term: Term(0),
                success: false,
                conflict_index: None,
            };
        }

        rx.await.unwrap_or(AppendEntriesResponse {
            term: Term(0),
            success: false,
            conflict_index: None,
        })
    }

    /// Shutdown the node; pending proposals resolve with `ShuttingDown`
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(RaftCommand::Shutdown);
    }
}

/// State owned by the event loop
struct NodeInner<SM> {
    id: NodeId,
    config: RaftConfig,
    state: Arc<RwLock<NodeState>>,
    log: RaftLog,
    state_machine: Arc<RwLock<SM>>,
    transport: Arc<dyn RaftTransport>,
    command_tx: mpsc::UnboundedSender<RaftCommand>,

    /// Proposals waiting for their index to be applied
    waiters: BTreeMap<u64, oneshot::Sender<Result<Applied>>>,

    /// Peers with an AppendEntries RPC outstanding. At most one RPC is in
    /// flight per peer, so heartbeats can never overtake log entries.
    inflight: HashSet<NodeId>,
}

/// Main node event loop
async fn run_node<SM: StateMachine>(
    mut inner: NodeInner<SM>,
    mut command_rx: mpsc::UnboundedReceiver<RaftCommand>,
) {
    let mut heartbeat_timer = interval(inner.config.heartbeat_interval);
    heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut election_deadline = inner.config.random_election_deadline();

    loop {
        let step = tokio::select! {
            maybe_cmd = command_rx.recv() => {
                match maybe_cmd {
                    Some(RaftCommand::Shutdown) | None => {
                        info!(node = %inner.id, "shutting down");
                        inner.fail_waiters(|| RaftError::ShuttingDown);
                        break;
                    }
                    Some(cmd) => inner.handle_command(cmd, &mut election_deadline),
                }
            }

            _ = tokio::time::sleep_until(election_deadline) => {
                let role = inner.state.read().role;
                if role == RaftRole::Leader {
                    // Leaders do not elect against themselves
                    election_deadline = inner.config.random_election_deadline();
                    Ok(())
                } else {
                    election_deadline = inner.config.random_election_deadline();
                    inner.start_election()
                }
            }

            _ = heartbeat_timer.tick() => {
                if inner.state.read().role == RaftRole::Leader {
                    inner.broadcast_append()
                } else {
                    Ok(())
                }
            }
        };

        if let Err(e) = step {
            // A failed durable write means this node can no longer uphold
            // its promises; stop serving rather than answer from memory.
            warn!(node = %inner.id, error = %e, "fatal node error, stopping");
            inner.fail_waiters(|| RaftError::ShuttingDown);
            break;
        }
    }
}

impl<SM: StateMachine> NodeInner<SM> {
    fn handle_command(
        &mut self,
        cmd: RaftCommand,
        election_deadline: &mut tokio::time::Instant,
    ) -> Result<()> {
        match cmd {
            RaftCommand::Propose {
                command,
                client_id,
                request_seq,
                reply,
            } => self.handle_propose(command, client_id, request_seq, reply),

            RaftCommand::RequestVote { request, reply } => {
                self.handle_request_vote(request, reply, election_deadline)
            }

            RaftCommand::AppendEntries { request, reply } => {
                self.handle_append_entries(request, reply, election_deadline)
            }

            RaftCommand::VoteReply {
                from,
                sent_term,
                response,
            } => self.handle_vote_reply(from, sent_term, response),

            RaftCommand::AppendReply {
                from,
                sent_term,
                prev_index,
                sent,
                response,
            } => self.handle_append_reply(from, sent_term, prev_index, sent, response),

            RaftCommand::PeerUnreachable { peer } => {
                // Retried on the next heartbeat tick
                self.inflight.remove(&peer);
                Ok(())
            }

            RaftCommand::Shutdown => unreachable!("handled in run_node"),
        }
    }

    // ----- elections -------------------------------------------------------

    fn start_election(&mut self) -> Result<()> {
        let (request, peers, won_already) = {
            let mut state = self.state.write();
            state.become_candidate();

            info!(
                node = %state.id,
                term = %state.persistent.current_term,
                "starting election"
            );

            let request = RequestVoteRequest {
                term: state.persistent.current_term,
                candidate_id: state.id,
                last_log_index: self.log.last_index(),
                last_log_term: self.log.last_term(),
            };

            let won_already = state
                .candidate_state
                .as_ref()
                .map(|c| c.has_majority(state.cluster_size()))
                .unwrap_or(false);

            (request, state.other_peers(), won_already)
        };

        // Vote for self must be durable before any ballot leaves this node
        let meta = self.state.read().persistent;
        self.log.save_meta(&meta)?;

        if won_already {
            // Single-node cluster
            return self.become_leader();
        }

        for peer in peers {
            self.spawn_vote_rpc(peer, request.clone());
        }
        Ok(())
    }

    fn spawn_vote_rpc(&self, peer: NodeId, request: RequestVoteRequest) {
        let sent_term = request.term;
        let transport = Arc::clone(&self.transport);
        let tx = self.command_tx.clone();
        let deadline = self.config.rpc_deadline;

        tokio::spawn(async move {
            match tokio::time::timeout(deadline, transport.request_vote(peer, request)).await {
                Ok(Ok(response)) => {
                    let _ = tx.send(RaftCommand::VoteReply {
                        from: peer,
                        sent_term,
                        response,
                    });
                }
                Ok(Err(e)) => {
                    debug!(peer = %peer, error = %e, "request_vote failed");
                }
                Err(_) => {
                    debug!(peer = %peer, "request_vote timed out");
                }
            }
        });
    }

    fn handle_vote_reply(
        &mut self,
        from: NodeId,
        sent_term: Term,
        response: RequestVoteResponse,
    ) -> Result<()> {
        if self.observe_term(response.term)? {
            return Ok(());
        }

        let won = {
            let mut state = self.state.write();
            if state.role != RaftRole::Candidate
                || sent_term != state.persistent.current_term
                || !response.vote_granted
            {
                false
            } else {
                let cluster_size = state.cluster_size();
                match state.candidate_state.as_mut() {
                    Some(candidate) => {
                        candidate.add_vote(from);
                        candidate.has_majority(cluster_size)
                    }
                    None => false,
                }
            }
        };

        if won {
            self.become_leader()?;
        }
        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        {
            let mut state = self.state.write();
            let last = self.log.last_index();
            state.become_leader(last);
            info!(
                node = %state.id,
                term = %state.persistent.current_term,
                last_index = %last,
                "became leader"
            );
        }
        self.inflight.clear();

        // Commit advances immediately in a single-node cluster; with peers
        // this is the initial empty AppendEntries that announces the leader.
        self.advance_commit()?;
        self.broadcast_append()
    }

    /// Adopt a higher term observed in a reply. Returns true if the term
    /// was adopted; the triggering message is then stale and dropped.
    fn observe_term(&mut self, term: Term) -> Result<bool> {
        let (adopted, was_leader) = {
            let mut state = self.state.write();
            if term <= state.persistent.current_term {
                (false, false)
            } else {
                let was_leader = state.role == RaftRole::Leader;
                state.become_follower(term, None);
                (true, was_leader)
            }
        };

        if !adopted {
            return Ok(false);
        }
        if was_leader {
            self.fail_waiters(|| RaftError::LeadershipLost);
        }
        let meta = self.state.read().persistent;
        self.log.save_meta(&meta)?;
        Ok(true)
    }

    // ----- voting ----------------------------------------------------------

    fn handle_request_vote(
        &mut self,
        req: RequestVoteRequest,
        reply: oneshot::Sender<RequestVoteResponse>,
        election_deadline: &mut tokio::time::Instant,
    ) -> Result<()> {
        let (response, granted, meta_changed, was_leader) = {
            let mut state = self.state.write();
            let before = state.persistent;
            let was_leader = state.role == RaftRole::Leader;

            if req.term > state.persistent.current_term {
                state.become_follower(req.term, None);
            }

            let mut vote_granted = false;

            // Grant vote if:
            // 1. Candidate's term >= our term
            // 2. We haven't voted for anyone else this term
            // 3. Candidate's log is at least as up-to-date as ours
            if req.term >= state.persistent.current_term {
                let already_voted = state
                    .persistent
                    .voted_for
                    .map(|v| v != req.candidate_id)
                    .unwrap_or(false);

                if !already_voted {
                    let our_last_term = self.log.last_term();
                    let our_last_index = self.log.last_index();

                    let log_ok = req.last_log_term > our_last_term
                        || (req.last_log_term == our_last_term
                            && req.last_log_index >= our_last_index);

                    if log_ok {
                        vote_granted = true;
                        state.persistent.voted_for = Some(req.candidate_id);

                        debug!(
                            node = %state.id,
                            candidate = %req.candidate_id,
                            term = %req.term,
                            "granted vote"
                        );
                    }
                }
            }

            let response = RequestVoteResponse {
                term: state.persistent.current_term,
                vote_granted,
            };
            let meta_changed = state.persistent != before;
            (response, vote_granted, meta_changed, was_leader)
        };

        if was_leader && meta_changed {
            self.fail_waiters(|| RaftError::LeadershipLost);
        }

        // Both the adopted term and the cast vote must survive a crash
        // before the ballot is answered
        if meta_changed {
            let meta = self.state.read().persistent;
            self.log.save_meta(&meta)?;
        }

        if granted {
            *election_deadline = self.config.random_election_deadline();
        }

        let _ = reply.send(response);
        Ok(())
    }

    // ----- log replication (follower side) ---------------------------------

    fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
        election_deadline: &mut tokio::time::Instant,
    ) -> Result<()> {
        // Term and role bookkeeping under the lock, no I/O
        let (current_term, meta_changed, was_leader) = {
            let mut state = self.state.write();

            if req.term < state.persistent.current_term {
                let response = AppendEntriesResponse {
                    term: state.persistent.current_term,
                    success: false,
                    conflict_index: None,
                };
                drop(state);
                let _ = reply.send(response);
                return Ok(());
            }

            let before = state.persistent;
            let was_leader = state.role == RaftRole::Leader;

            // Valid leader for this term: candidates and stale leaders yield
            state.become_follower(req.term, Some(req.leader_id));

            (
                state.persistent.current_term,
                state.persistent != before,
                was_leader,
            )
        };

        if was_leader {
            self.fail_waiters(|| RaftError::LeadershipLost);
        }
        if meta_changed {
            let meta = self.state.read().persistent;
            self.log.save_meta(&meta)?;
        }

        // Any valid leader contact resets the election timer
        *election_deadline = self.config.random_election_deadline();

        // Consistency check on the previous entry
        let prev_matches = matches!(
            self.log.get_term(req.prev_log_index)?,
            Some(term) if term == req.prev_log_term
        );

        if !prev_matches {
            let conflict_index = self.conflict_hint(req.prev_log_index)?;
            debug!(
                node = %self.id,
                prev = %req.prev_log_index,
                conflict = %conflict_index,
                "log mismatch, asking leader to back up"
            );
            let _ = reply.send(AppendEntriesResponse {
                term: current_term,
                success: false,
                conflict_index: Some(conflict_index),
            });
            return Ok(());
        }

        // Reconcile incoming entries: truncate on conflict, append the rest
        let mut to_append: Vec<Entry> = Vec::new();
        for (i, entry) in req.entries.iter().enumerate() {
            match self.log.get_term(entry.index)? {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    warn!(
                        node = %self.id,
                        from = %entry.index,
                        "truncating conflicting log suffix"
                    );
                    self.log.delete_from(entry.index)?;
                    to_append = req.entries[i..].to_vec();
                    break;
                }
                None => {
                    to_append = req.entries[i..].to_vec();
                    break;
                }
            }
        }
        if !to_append.is_empty() {
            self.log.append(to_append)?;
        }

        // Advance commit index up to the last entry this request vouches for
        let last_new = req.prev_log_index + req.entries.len() as u64;
        {
            let mut state = self.state.write();
            if req.leader_commit > state.volatile.commit_index {
                state.volatile.commit_index = req.leader_commit.min(last_new);
            }
        }
        self.apply_committed()?;

        let _ = reply.send(AppendEntriesResponse {
            term: current_term,
            success: true,
            conflict_index: None,
        });
        Ok(())
    }

    /// First index of the term that conflicts at `prev`, or one past our
    /// last index when the log is simply too short
    fn conflict_hint(&self, prev: LogIndex) -> Result<LogIndex> {
        let last = self.log.last_index();
        if prev > last {
            return Ok(last + 1);
        }
        let conflicting_term = match self.log.get_term(prev)? {
            Some(term) => term,
            None => return Ok(last + 1),
        };
        let mut first = prev;
        while first.0 > 1 {
            match self.log.get_term(first - 1)? {
                Some(term) if term == conflicting_term => first = first - 1,
                _ => break,
            }
        }
        Ok(first)
    }

    // ----- proposals and replication (leader side) -------------------------

    fn handle_propose(
        &mut self,
        command: Vec<u8>,
        client_id: String,
        request_seq: u64,
        reply: oneshot::Sender<Result<Applied>>,
    ) -> Result<()> {
        let (term, leader_hint, is_leader) = {
            let state = self.state.read();
            (
                state.persistent.current_term,
                state.leader_id,
                state.role == RaftRole::Leader,
            )
        };

        if !is_leader {
            let _ = reply.send(Err(RaftError::NotLeader(leader_hint)));
            return Ok(());
        }

        let index = self.log.last_index() + 1;
        let entry = Entry {
            term,
            index,
            command,
            client_id,
            request_seq,
        };

        // Durable locally before any replica sees it
        self.log.append(vec![entry])?;

        debug!(node = %self.id, index = %index, term = %term, "proposed entry");

        self.waiters.insert(index.0, reply);

        // Single-node clusters commit right here; everyone else starts
        // replicating now rather than at the next heartbeat
        self.advance_commit()?;
        self.broadcast_append()
    }

    fn broadcast_append(&mut self) -> Result<()> {
        let peers = self.state.read().other_peers();
        for peer in peers {
            if !self.inflight.contains(&peer) {
                self.send_append(peer)?;
            }
        }
        Ok(())
    }

    fn send_append(&mut self, peer: NodeId) -> Result<()> {
        let request = {
            let state = self.state.read();
            if state.role != RaftRole::Leader {
                return Ok(());
            }
            let leader_state = match state.leader_state.as_ref() {
                Some(ls) => ls,
                None => return Ok(()),
            };

            let next = leader_state
                .next_index(peer)
                .unwrap_or_else(|| self.log.last_index() + 1);
            let prev = next - 1;
            let prev_term = match self.log.get_term(prev)? {
                Some(term) => term,
                None => return Ok(()),
            };
            let entries = self.log.get_from(next, self.config.max_append_entries)?;

            AppendEntriesRequest {
                term: state.persistent.current_term,
                leader_id: state.id,
                prev_log_index: prev,
                prev_log_term: prev_term,
                entries,
                leader_commit: state.volatile.commit_index,
            }
        };

        self.inflight.insert(peer);

        let sent_term = request.term;
        let prev_index = request.prev_log_index;
        let sent = request.entries.len() as u64;
        let transport = Arc::clone(&self.transport);
        let tx = self.command_tx.clone();
        let deadline = self.config.rpc_deadline;

        tokio::spawn(async move {
            match tokio::time::timeout(deadline, transport.append_entries(peer, request)).await {
                Ok(Ok(response)) => {
                    let _ = tx.send(RaftCommand::AppendReply {
                        from: peer,
                        sent_term,
                        prev_index,
                        sent,
                        response,
                    });
                }
                Ok(Err(e)) => {
                    debug!(peer = %peer, error = %e, "append_entries failed");
                    let _ = tx.send(RaftCommand::PeerUnreachable { peer });
                }
                Err(_) => {
                    debug!(peer = %peer, "append_entries timed out");
                    let _ = tx.send(RaftCommand::PeerUnreachable { peer });
                }
            }
        });
        Ok(())
    }

    fn handle_append_reply(
        &mut self,
        from: NodeId,
        sent_term: Term,
        prev_index: LogIndex,
        sent: u64,
        response: AppendEntriesResponse,
    ) -> Result<()> {
        self.inflight.remove(&from);

        if self.observe_term(response.term)? {
            return Ok(());
        }

        {
            let mut state = self.state.write();
            if state.role != RaftRole::Leader || sent_term != state.persistent.current_term {
                return Ok(());
            }
            let leader_state = match state.leader_state.as_mut() {
                Some(ls) => ls,
                None => return Ok(()),
            };

            if response.success {
                let matched = prev_index + sent;
                leader_state.set_match_index(from, matched);
                leader_state.set_next_index(from, matched + 1);
            } else {
                // Back up; the follower's hint lets us skip a whole term
                let fallback = {
                    let current = leader_state.next_index(from).unwrap_or(LogIndex(1));
                    if current.0 > 1 {
                        current - 1
                    } else {
                        LogIndex(1)
                    }
                };
                let next = response
                    .conflict_index
                    .unwrap_or(fallback)
                    .max(LogIndex(1));
                leader_state.set_next_index(from, next);
            }
        }

        if response.success {
            self.advance_commit()?;
        }

        // Keep pumping while the follower is behind; retry conflicts now
        let behind = {
            let state = self.state.read();
            state
                .leader_state
                .as_ref()
                .and_then(|ls| ls.next_index(from))
                .map(|next| self.log.last_index() >= next)
                .unwrap_or(false)
        };
        if behind || !response.success {
            self.send_append(from)?;
        }
        Ok(())
    }

    fn advance_commit(&mut self) -> Result<()> {
        let new_commit = {
            let state = self.state.read();
            if state.role != RaftRole::Leader {
                return Ok(());
            }
            let leader_state = match state.leader_state.as_ref() {
                Some(ls) => ls,
                None => return Ok(()),
            };

            // Own log counts toward the majority
            let mut matches: Vec<u64> = vec![self.log.last_index().0];
            for (_, m) in &leader_state.match_index {
                matches.push(m.0);
            }
            matches.sort_unstable_by(|a, b| b.cmp(a));

            // Entry replicated on a strict majority of the cluster
            let candidate = LogIndex(matches[state.cluster_size() / 2]);

            // Only entries of the current term commit by counting; older
            // ones commit transitively with them
            if candidate > state.volatile.commit_index
                && self.log.get_term(candidate)? == Some(state.persistent.current_term)
            {
                Some(candidate)
            } else {
                None
            }
        };

        if let Some(commit) = new_commit {
            {
                let mut state = self.state.write();
                state.volatile.commit_index = commit;
            }
            debug!(node = %self.id, commit = %commit, "advanced commit index");
            self.apply_committed()?;
        }
        Ok(())
    }

    // ----- applying --------------------------------------------------------

    fn apply_committed(&mut self) -> Result<()> {
        loop {
            let next = {
                let state = self.state.read();
                if state.volatile.last_applied >= state.volatile.commit_index {
                    break;
                }
                state.volatile.last_applied + 1
            };

            let entry = match self.log.get(next)? {
                Some(entry) => entry,
                None => {
                    return Err(RaftError::Internal(format!(
                        "committed entry {next} missing from log"
                    )))
                }
            };

            let output = self.state_machine.write().apply(&entry.command);

            {
                let mut state = self.state.write();
                state.volatile.last_applied = next;
            }

            debug!(node = %self.id, index = %next, "applied entry");

            if let Some(waiter) = self.waiters.remove(&next.0) {
                let _ = waiter.send(Ok(Applied {
                    index: next,
                    response: output,
                }));
            }
        }
        Ok(())
    }

    fn fail_waiters<F: Fn() -> RaftError>(&mut self, make_error: F) {
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            let _ = waiter.send(Err(make_error()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;

    /// Echo state machine: records applied commands and returns them
    struct EchoMachine {
        applied: Vec<Vec<u8>>,
    }

    impl EchoMachine {
        fn new() -> Self {
            Self { applied: vec![] }
        }
    }

    impl StateMachine for EchoMachine {
        fn apply(&mut self, command: &[u8]) -> Vec<u8> {
            self.applied.push(command.to_vec());
            command.to_vec()
        }
    }

    #[tokio::test]
    async fn test_single_node_elects_and_applies() {
        let net = MemoryNetwork::new();
        let machine = Arc::new(RwLock::new(EchoMachine::new()));
        let node = RaftNode::new(
            NodeId(1),
            vec![NodeId(1)],
            RaftConfig::default(),
            Box::new(MemoryStorage::new()),
            Arc::clone(&machine),
            net.transport(NodeId(1)),
        )
        .await
        .unwrap();
        net.register(NodeId(1), node.clone());

        // A lone node wins its own election after one timeout
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !node.is_leader() {
            assert!(tokio::time::Instant::now() < deadline, "no leader elected");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let applied = node.propose(b"hello".to_vec(), "c1", 1).await.unwrap();
        assert_eq!(applied.index, LogIndex(1));
        assert_eq!(applied.response, b"hello");
        assert_eq!(machine.read().applied, vec![b"hello".to_vec()]);

        node.shutdown();
    }

    #[tokio::test]
    async fn test_follower_rejects_proposals() {
        let net = MemoryNetwork::new();
        let machine = Arc::new(RwLock::new(EchoMachine::new()));
        // Two-node membership, but the peer never starts: this node can
        // never win an election and stays candidate/follower
        let node = RaftNode::new(
            NodeId(1),
            vec![NodeId(1), NodeId(2)],
            RaftConfig::default(),
            Box::new(MemoryStorage::new()),
            machine,
            net.transport(NodeId(1)),
        )
        .await
        .unwrap();
        net.register(NodeId(1), node.clone());

        match node.propose(b"nope".to_vec(), "c1", 1).await {
            Err(RaftError::NotLeader(_)) => {}
            other => panic!("expected NotLeader, got {other:?}"),
        }

        node.shutdown();
    }
}
