//! Node configuration
//!
//! One JSON file per node describes its identity, addresses, the full peer
//! table, timing knobs and the seed data for the demo deployment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use ticketbox_booking::Movie;
use ticketbox_consensus::{NodeId, RaftConfig, RaftConfigBuilder};

/// A cluster member as seen from every node's config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: u64,

    /// Address the peer's Raft RPC listener is bound to
    pub raft_addr: String,

    /// Address the peer serves clients on; used for leader hints
    pub client_addr: String,
}

/// Demo credential entry consumed by the authenticator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: u64,

    /// Client-facing listener
    pub listen_addr: String,

    /// Raft peer listener
    pub raft_addr: String,

    /// Full cluster membership, this node included
    pub peers: Vec<PeerConfig>,

    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_rpc_deadline_ms")]
    pub rpc_deadline_ms: u64,

    #[serde(default = "default_propose_timeout_ms")]
    pub propose_timeout_ms: u64,

    #[serde(default = "default_seat_hold_ttl_ms")]
    pub seat_hold_ttl_ms: u64,

    #[serde(default = "default_apply_cache_size")]
    pub apply_cache_size: usize,

    /// Directory for raft.meta / raft.log; None keeps everything in memory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Catalog seeded once the cluster elects its first leader
    #[serde(default)]
    pub movies: Vec<Movie>,

    /// Demo users accepted by Login
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

fn default_election_timeout_min_ms() -> u64 {
    150
}
fn default_election_timeout_max_ms() -> u64 {
    300
}
fn default_heartbeat_interval_ms() -> u64 {
    50
}
fn default_rpc_deadline_ms() -> u64 {
    100
}
fn default_propose_timeout_ms() -> u64 {
    3_000
}
fn default_seat_hold_ttl_ms() -> u64 {
    300_000
}
fn default_apply_cache_size() -> usize {
    64
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(ConfigError::Invalid(
                "election_timeout_min_ms must be below election_timeout_max_ms".into(),
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be below election_timeout_min_ms".into(),
            ));
        }
        if self.rpc_deadline_ms >= self.election_timeout_min_ms {
            return Err(ConfigError::Invalid(
                "rpc_deadline_ms must be below election_timeout_min_ms".into(),
            ));
        }
        if self.apply_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "apply_cache_size must be at least 1".into(),
            ));
        }
        if !self.peers.iter().any(|p| p.id == self.node_id) {
            return Err(ConfigError::Invalid(format!(
                "peers[] must contain this node (id {})",
                self.node_id
            )));
        }
        for peer in &self.peers {
            peer.raft_addr.parse::<SocketAddr>().map_err(|_| {
                ConfigError::Invalid(format!("bad raft_addr for peer {}", peer.id))
            })?;
        }
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::Invalid("bad listen_addr".into()))?;
        self.raft_addr
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::Invalid("bad raft_addr".into()))?;
        Ok(())
    }

    pub fn raft_config(&self) -> RaftConfig {
        RaftConfigBuilder::new()
            .election_timeout(
                Duration::from_millis(self.election_timeout_min_ms),
                Duration::from_millis(self.election_timeout_max_ms),
            )
            .heartbeat_interval(Duration::from_millis(self.heartbeat_interval_ms))
            .rpc_deadline(Duration::from_millis(self.rpc_deadline_ms))
            .build()
    }

    /// All member ids, this node included
    pub fn member_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| NodeId(p.id)).collect()
    }

    /// Raft addresses of the other members
    pub fn raft_peer_addrs(&self) -> HashMap<NodeId, SocketAddr> {
        self.peers
            .iter()
            .filter(|p| p.id != self.node_id)
            .filter_map(|p| p.raft_addr.parse().ok().map(|addr| (NodeId(p.id), addr)))
            .collect()
    }

    /// Client addresses by node id, for leader hints
    pub fn client_addrs(&self) -> HashMap<NodeId, String> {
        self.peers
            .iter()
            .map(|p| (NodeId(p.id), p.client_addr.clone()))
            .collect()
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_deadline_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> NodeConfig {
        serde_json::from_value(serde_json::json!({
            "node_id": 1,
            "listen_addr": "127.0.0.1:7001",
            "raft_addr": "127.0.0.1:8001",
            "peers": [
                {"id": 1, "raft_addr": "127.0.0.1:8001", "client_addr": "127.0.0.1:7001"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let config = minimal();
        config.validate().unwrap();
        assert_eq!(config.election_timeout_min_ms, 150);
        assert_eq!(config.seat_hold_ttl_ms, 300_000);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn rejects_missing_self_in_peers() {
        let mut config = minimal();
        config.node_id = 9;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_inverted_timeouts() {
        let mut config = minimal();
        config.election_timeout_min_ms = 400;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn addr_tables_exclude_and_include_self_correctly() {
        let config: NodeConfig = serde_json::from_value(serde_json::json!({
            "node_id": 1,
            "listen_addr": "127.0.0.1:7001",
            "raft_addr": "127.0.0.1:8001",
            "peers": [
                {"id": 1, "raft_addr": "127.0.0.1:8001", "client_addr": "127.0.0.1:7001"},
                {"id": 2, "raft_addr": "127.0.0.1:8002", "client_addr": "127.0.0.1:7002"}
            ]
        }))
        .unwrap();

        assert_eq!(config.member_ids().len(), 2);
        assert_eq!(config.raft_peer_addrs().len(), 1);
        assert!(config.raft_peer_addrs().contains_key(&NodeId(2)));
        assert_eq!(config.client_addrs().len(), 2);
    }
}
