//! Raft consensus for the ticket-booking cluster
//!
//! This library provides a leader-based replicated state machine: leader
//! election with randomized timeouts, durable log replication with
//! conflict-accelerated backtracking, and in-order application of committed
//! commands to a pluggable [`StateMachine`].
//!
//! # Example
//!
//! ```no_run
//! use ticketbox_consensus::{
//!     MemoryNetwork, MemoryStorage, NodeId, RaftConfig, RaftNode, StateMachine,
//! };
//! use parking_lot::RwLock;
//! use std::sync::Arc;
//!
//! struct Counter(u64);
//!
//! impl StateMachine for Counter {
//!     fn apply(&mut self, _command: &[u8]) -> Vec<u8> {
//!         self.0 += 1;
//!         self.0.to_le_bytes().to_vec()
//!     }
//! }
//!
//! # async fn example() -> ticketbox_consensus::Result<()> {
//! let net = MemoryNetwork::new();
//! let node = RaftNode::new(
//!     NodeId(1),
//!     vec![NodeId(1)],
//!     RaftConfig::default(),
//!     Box::new(MemoryStorage::new()),
//!     Arc::new(RwLock::new(Counter(0))),
//!     net.transport(NodeId(1)),
//! )
//! .await?;
//! net.register(NodeId(1), node.clone());
//!
//! // Once elected, commands propose through the leader
//! let applied = node.propose(b"tick".to_vec(), "client-1", 1).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod node;
mod rpc;
mod state;
mod storage;
mod transport;
mod types;

pub use config::{RaftConfig, RaftConfigBuilder};
pub use node::{Applied, RaftNode, StateMachine};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, PeerReply, PeerRequest, RequestVoteRequest,
    RequestVoteResponse,
};
pub use state::{NodeState, RaftRole};
pub use storage::{FileStorage, MemoryStorage, Metadata, RaftLog, Storage};
pub use transport::{
    serve_peer_rpc, MemoryNetwork, MemoryTransport, RaftTransport, TcpTransport,
};
pub use types::{Entry, LogIndex, NodeId, Term};

/// Result type for Raft operations
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur during Raft operations
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("Not the leader (current leader: {0:?})")]
    NotLeader(Option<NodeId>),

    #[error("Leadership lost before the proposal committed")]
    LeadershipLost,

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Log index out of range: {0}")]
    LogIndexOutOfRange(LogIndex),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Persistent store is corrupt: {0}")]
    StorageCorrupt(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
