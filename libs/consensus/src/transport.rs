//! Peer-to-peer RPC transport
//!
//! Outbound calls are fire-and-await with a deadline applied by the node;
//! a transport failure is never fatal, it just means the caller retries on
//! its next tick. Wire format is 4-byte length-prefixed bincode frames.

use crate::node::RaftNode;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, PeerReply, PeerRequest, RequestVoteRequest,
    RequestVoteResponse,
};
use crate::types::NodeId;
use crate::{RaftError, Result};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

/// Outbound RPC client fan-out to peers
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        to: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        to: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

// ----- TCP ----------------------------------------------------------------

/// TCP transport: one short-lived connection per call
pub struct TcpTransport {
    peers: HashMap<NodeId, SocketAddr>,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(peers: HashMap<NodeId, SocketAddr>, connect_timeout: Duration) -> Self {
        Self {
            peers,
            connect_timeout,
        }
    }

    async fn call(&self, to: NodeId, request: PeerRequest) -> Result<PeerReply> {
        let addr = *self
            .peers
            .get(&to)
            .ok_or_else(|| RaftError::Rpc(format!("unknown peer {to}")))?;

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RaftError::Rpc(format!("connect to {to} timed out")))?
            .map_err(|e| RaftError::Rpc(format!("connect to {to}: {e}")))?;

        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let bytes = bincode::serialize(&request)
            .map_err(|e| RaftError::Rpc(format!("encode request: {e}")))?;
        framed
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| RaftError::Rpc(format!("send to {to}: {e}")))?;

        let frame = framed
            .next()
            .await
            .ok_or_else(|| RaftError::Rpc(format!("{to} closed the connection")))?
            .map_err(|e| RaftError::Rpc(format!("recv from {to}: {e}")))?;

        bincode::deserialize(&frame).map_err(|e| RaftError::Rpc(format!("decode reply: {e}")))
    }
}

#[async_trait]
impl RaftTransport for TcpTransport {
    async fn request_vote(
        &self,
        to: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        match self.call(to, PeerRequest::RequestVote(request)).await? {
            PeerReply::RequestVote(response) => Ok(response),
            PeerReply::AppendEntries(_) => {
                Err(RaftError::Rpc(format!("{to} answered the wrong RPC")))
            }
        }
    }

    async fn append_entries(
        &self,
        to: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self.call(to, PeerRequest::AppendEntries(request)).await? {
            PeerReply::AppendEntries(response) => Ok(response),
            PeerReply::RequestVote(_) => {
                Err(RaftError::Rpc(format!("{to} answered the wrong RPC")))
            }
        }
    }
}

/// Accept loop for inbound peer RPCs
///
/// Runs until the listener is dropped by aborting the task. Each
/// connection gets its own handler; a bad frame kills only that
/// connection.
pub async fn serve_peer_rpc(listener: TcpListener, node: RaftNode) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_peer_conn(stream, node).await {
                        debug!(peer_addr = %addr, error = %e, "peer connection ended");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "peer accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_peer_conn(stream: TcpStream, node: RaftNode) -> Result<()> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(|e| RaftError::Rpc(format!("recv: {e}")))?;
        let request: PeerRequest = bincode::deserialize(&frame)
            .map_err(|e| RaftError::Rpc(format!("decode request: {e}")))?;

        let reply = match request {
            PeerRequest::RequestVote(req) => PeerReply::RequestVote(node.request_vote(req).await),
            PeerRequest::AppendEntries(req) => {
                PeerReply::AppendEntries(node.append_entries(req).await)
            }
        };

        let bytes =
            bincode::serialize(&reply).map_err(|e| RaftError::Rpc(format!("encode reply: {e}")))?;
        framed
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| RaftError::Rpc(format!("send reply: {e}")))?;
    }
    Ok(())
}

// ----- in-process ---------------------------------------------------------

/// In-process network hub for cluster tests and demos
///
/// Routes calls directly to registered node handles and can sever links
/// to simulate partitions or crashed peers.
pub struct MemoryNetwork {
    nodes: Mutex<HashMap<NodeId, RaftNode>>,
    severed: Mutex<HashSet<(NodeId, NodeId)>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            severed: Mutex::new(HashSet::new()),
        })
    }

    pub fn register(&self, id: NodeId, node: RaftNode) {
        self.nodes.lock().insert(id, node);
    }

    /// Remove a node from the network, as if its process died
    pub fn deregister(&self, id: NodeId) {
        self.nodes.lock().remove(&id);
    }

    /// Transport handle for one member of this network
    pub fn transport(self: &Arc<Self>, from: NodeId) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            from,
            net: Arc::clone(self),
        })
    }

    /// Cut the link between two nodes, both directions
    pub fn sever(&self, a: NodeId, b: NodeId) {
        let mut severed = self.severed.lock();
        severed.insert((a, b));
        severed.insert((b, a));
    }

    /// Restore the link between two nodes
    pub fn heal(&self, a: NodeId, b: NodeId) {
        let mut severed = self.severed.lock();
        severed.remove(&(a, b));
        severed.remove(&(b, a));
    }

    /// Cut all links to and from a node
    pub fn isolate(&self, id: NodeId) {
        let others: Vec<NodeId> = self
            .nodes
            .lock()
            .keys()
            .copied()
            .filter(|&other| other != id)
            .collect();
        for other in others {
            self.sever(id, other);
        }
    }

    /// Restore all links to and from a node
    pub fn rejoin(&self, id: NodeId) {
        self.severed
            .lock()
            .retain(|&(a, b)| a != id && b != id);
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<RaftNode> {
        if self.severed.lock().contains(&(from, to)) {
            return Err(RaftError::Rpc(format!("{from} -> {to} is partitioned")));
        }
        self.nodes
            .lock()
            .get(&to)
            .cloned()
            .ok_or_else(|| RaftError::Rpc(format!("{to} is not reachable")))
    }
}

/// Per-node handle into a [`MemoryNetwork`]
pub struct MemoryTransport {
    from: NodeId,
    net: Arc<MemoryNetwork>,
}

#[async_trait]
impl RaftTransport for MemoryTransport {
    async fn request_vote(
        &self,
        to: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let node = self.net.route(self.from, to)?;
        Ok(node.request_vote(request).await)
    }

    async fn append_entries(
        &self,
        to: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node = self.net.route(self.from, to)?;
        Ok(node.append_entries(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Term;

    #[tokio::test]
    async fn test_memory_network_partition_blocks_route() {
        let net = MemoryNetwork::new();
        let transport = net.transport(NodeId(1));

        // Unregistered peer is unreachable
        let request = RequestVoteRequest {
            term: Term(1),
            candidate_id: NodeId(1),
            last_log_index: crate::types::LogIndex(0),
            last_log_term: Term(0),
        };
        assert!(transport.request_vote(NodeId(2), request.clone()).await.is_err());

        // Severed link is unreachable even for registered peers
        net.sever(NodeId(1), NodeId(2));
        assert!(net.route(NodeId(1), NodeId(2)).is_err());
        net.heal(NodeId(1), NodeId(2));
    }
}
