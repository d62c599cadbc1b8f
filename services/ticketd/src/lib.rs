//! ticketd: a replicated movie-ticket booking node
//!
//! Each process is one member of a Raft cluster. Writes reach the booking
//! state machine through consensus; reads are served from the local
//! replica. See `NodeConfig` for the knobs a deployment sets per node.

pub mod api;
pub mod assistant;
pub mod auth;
pub mod client;
pub mod config;
pub mod front;
pub mod server;

pub use api::{ClientRequest, ClientResponse, ErrorCode};
pub use config::{ConfigError, NodeConfig, PeerConfig, UserConfig};
pub use server::{ServeError, TicketServer};

/// Milliseconds since the Unix epoch
///
/// Only ever called on the proposing side; replicated commands carry this
/// stamp so the state machine itself never needs a clock.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
