//! Node bootstrap and background tasks
//!
//! Wires storage, Raft, the service front and both listeners together, and
//! runs the two leader-side proposers: catalog seeding and hold expiry.

use crate::api::{ClientRequest, ClientResponse, ErrorCode};
use crate::assistant::ScriptedAssistant;
use crate::auth::StaticAuthenticator;
use crate::config::{ConfigError, NodeConfig};
use crate::front::ServiceFront;
use crate::now_ms;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use ticketbox_booking::{Command, Envelope, Movie, TicketStore};
use ticketbox_consensus::{
    serve_peer_rpc, FileStorage, MemoryStorage, NodeId, RaftError, RaftNode, Storage, TcpTransport,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("persistent store: {0}")]
    Storage(RaftError),

    #[error("raft: {0}")]
    Raft(RaftError),
}

/// A running ticketd node
pub struct TicketServer {
    node: RaftNode,
    store: Arc<RwLock<TicketStore>>,
    client_addr: SocketAddr,
    raft_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl TicketServer {
    pub async fn start(config: NodeConfig) -> Result<Self, ServeError> {
        config.validate()?;

        let raft_listener = bind(&config.raft_addr).await?;
        let client_listener = bind(&config.listen_addr).await?;
        let raft_addr = local_addr(&raft_listener, &config.raft_addr)?;
        let client_addr = local_addr(&client_listener, &config.listen_addr)?;

        let storage: Box<dyn Storage> = match &config.data_dir {
            Some(dir) => Box::new(FileStorage::open(dir).map_err(ServeError::Storage)?),
            None => Box::new(MemoryStorage::new()),
        };

        let store = Arc::new(RwLock::new(TicketStore::new(config.apply_cache_size)));
        let transport = Arc::new(TcpTransport::new(
            config.raft_peer_addrs(),
            config.rpc_deadline(),
        ));

        let node = RaftNode::new(
            NodeId(config.node_id),
            config.member_ids(),
            config.raft_config(),
            storage,
            Arc::clone(&store),
            transport,
        )
        .await
        .map_err(ServeError::Raft)?;

        let auth = Arc::new(StaticAuthenticator::new(
            &config.users,
            Duration::from_secs(3600),
        ));
        let assistant = Arc::new(ScriptedAssistant);
        let front = Arc::new(ServiceFront::new(
            node.clone(),
            Arc::clone(&store),
            auth,
            assistant,
            &config,
        ));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(serve_peer_rpc(raft_listener, node.clone())));
        tasks.push(tokio::spawn(serve_clients(client_listener, front)));
        tasks.push(tokio::spawn(seed_catalog(
            node.clone(),
            Arc::clone(&store),
            config.movies.clone(),
        )));
        tasks.push(tokio::spawn(expire_holds_loop(
            node.clone(),
            expiry_interval(config.seat_hold_ttl_ms),
        )));

        info!(
            node = config.node_id,
            client = %client_addr,
            raft = %raft_addr,
            "ticketd node running"
        );

        Ok(Self {
            node,
            store,
            client_addr,
            raft_addr,
            tasks,
        })
    }

    pub fn node(&self) -> &RaftNode {
        &self.node
    }

    pub fn store(&self) -> &Arc<RwLock<TicketStore>> {
        &self.store
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn raft_addr(&self) -> SocketAddr {
        self.raft_addr
    }

    /// Cooperative shutdown: stop the raft loop, then the listeners
    pub async fn stop(self) {
        self.node.shutdown();
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn bind(addr: &str) -> Result<TcpListener, ServeError> {
    TcpListener::bind(addr).await.map_err(|source| ServeError::Bind {
        addr: addr.to_string(),
        source,
    })
}

fn local_addr(listener: &TcpListener, addr: &str) -> Result<SocketAddr, ServeError> {
    listener.local_addr().map_err(|source| ServeError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Sweep twice as often as holds expire, but never busier than 10 Hz
fn expiry_interval(seat_hold_ttl_ms: u64) -> Duration {
    Duration::from_millis((seat_hold_ttl_ms / 2).clamp(100, 1_000))
}

// ----- client connections -------------------------------------------------

async fn serve_clients(listener: TcpListener, front: Arc<ServiceFront>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let front = Arc::clone(&front);
                tokio::spawn(async move {
                    if let Err(e) = handle_client_conn(stream, front).await {
                        debug!(client_addr = %addr, error = %e, "client connection ended");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "client accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_client_conn(
    stream: TcpStream,
    front: Arc<ServiceFront>,
) -> Result<(), std::io::Error> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let response = match bincode::deserialize::<ClientRequest>(&frame) {
            Ok(request) => front.handle(request).await,
            Err(e) => {
                debug!(error = %e, "undecodable client frame");
                ClientResponse::error(ErrorCode::Internal)
            }
        };
        let bytes = bincode::serialize(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        framed.send(Bytes::from(bytes)).await?;
    }
    Ok(())
}

// ----- leader-side proposers ----------------------------------------------

/// Propose the catalog until some leader has applied it
///
/// Every node runs this; the command is a no-op on a seeded store, so the
/// race between nodes is harmless. Followers just watch their replica fill.
async fn seed_catalog(node: RaftNode, store: Arc<RwLock<TicketStore>>, movies: Vec<Movie>) {
    if movies.is_empty() {
        return;
    }
    let client_id = format!("seeder:{}", node.id().0);

    loop {
        if !store.read().movies().is_empty() {
            return;
        }
        if node.is_leader() {
            let envelope = Envelope {
                client_id: client_id.clone(),
                request_seq: 1,
                applied_at_ms: now_ms(),
                command: Command::SeedMovies {
                    movies: movies.clone(),
                },
            };
            match node.propose(envelope.encode(), client_id.clone(), 1).await {
                Ok(applied) => {
                    info!(index = %applied.index, "movie catalog seeded");
                    return;
                }
                Err(e) => debug!(error = %e, "seeding attempt failed, will retry"),
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Periodically propose an expiry sweep while this node leads
///
/// The sweep carries the leader's clock, so replicas expire identically.
/// Sequence numbers are wall-clock stamps: they stay monotone across
/// process restarts, which keeps the idempotency cache out of the way.
async fn expire_holds_loop(node: RaftNode, every: Duration) {
    let client_id = format!("expirer:{}", node.id().0);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !node.is_leader() {
            continue;
        }
        let seq = now_ms();
        let envelope = Envelope {
            client_id: client_id.clone(),
            request_seq: seq,
            applied_at_ms: now_ms(),
            command: Command::ExpireHolds,
        };
        if let Err(e) = node.propose(envelope.encode(), client_id.clone(), seq).await {
            debug!(error = %e, "expiry sweep not committed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_interval_is_clamped() {
        assert_eq!(expiry_interval(10_000_000), Duration::from_millis(1_000));
        assert_eq!(expiry_interval(50), Duration::from_millis(100));
        assert_eq!(expiry_interval(1_000), Duration::from_millis(500));
    }
}
