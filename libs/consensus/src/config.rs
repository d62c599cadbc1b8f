//! Raft configuration

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for a Raft node
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Minimum election timeout
    ///
    /// This is the minimum time a follower waits before starting an election.
    /// The actual timeout is randomized between min and max to avoid split votes.
    pub election_timeout_min: Duration,

    /// Maximum election timeout
    pub election_timeout_max: Duration,

    /// Heartbeat interval (how often leader sends AppendEntries)
    ///
    /// Should be significantly smaller than election timeout to prevent
    /// followers from timing out.
    pub heartbeat_interval: Duration,

    /// Deadline for a single outbound peer RPC
    ///
    /// Must be shorter than the election timeout so a dead peer cannot
    /// stall an election round.
    pub rpc_deadline: Duration,

    /// Maximum number of entries to send in a single AppendEntries RPC
    ///
    /// Larger values improve throughput but increase memory usage and
    /// can cause longer RPC latencies.
    pub max_append_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            // Election timeout between 150-300ms (Raft paper recommendation)
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),

            // Heartbeat every 50ms (well below election timeout minimum)
            heartbeat_interval: Duration::from_millis(50),

            // Abandon a peer RPC after 100ms
            rpc_deadline: Duration::from_millis(100),

            // Send up to 64 entries per RPC
            max_append_entries: 64,
        }
    }
}

impl RaftConfig {
    /// Draw a fresh randomized election deadline
    ///
    /// Called every time the election timer is reset, so each round gets
    /// independent jitter.
    pub fn random_election_deadline(&self) -> Instant {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        let timeout = rand::thread_rng().gen_range(min..=max);
        Instant::now() + Duration::from_millis(timeout)
    }
}

/// Builder for RaftConfig
pub struct RaftConfigBuilder {
    config: RaftConfig,
}

impl RaftConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RaftConfig::default(),
        }
    }

    pub fn election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.config.election_timeout_min = min;
        self.config.election_timeout_max = max;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn rpc_deadline(mut self, deadline: Duration) -> Self {
        self.config.rpc_deadline = deadline;
        self
    }

    pub fn max_append_entries(mut self, max: usize) -> Self {
        self.config.max_append_entries = max;
        self
    }

    pub fn build(self) -> RaftConfig {
        // Validate configuration
        assert!(
            self.config.election_timeout_min < self.config.election_timeout_max,
            "election_timeout_min must be less than election_timeout_max"
        );
        assert!(
            self.config.heartbeat_interval < self.config.election_timeout_min,
            "heartbeat_interval must be less than election_timeout_min"
        );
        assert!(
            self.config.rpc_deadline < self.config.election_timeout_min,
            "rpc_deadline must be less than election_timeout_min"
        );
        assert!(
            self.config.max_append_entries > 0,
            "max_append_entries must be greater than 0"
        );

        self.config
    }
}

impl Default for RaftConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RaftConfig::default();
        assert!(config.heartbeat_interval < config.election_timeout_min);
        assert!(config.election_timeout_min < config.election_timeout_max);
        assert!(config.rpc_deadline < config.election_timeout_min);
    }

    #[test]
    fn test_builder() {
        let config = RaftConfigBuilder::new()
            .election_timeout(Duration::from_millis(200), Duration::from_millis(400))
            .heartbeat_interval(Duration::from_millis(100))
            .rpc_deadline(Duration::from_millis(80))
            .max_append_entries(50)
            .build();

        assert_eq!(config.election_timeout_min, Duration::from_millis(200));
        assert_eq!(config.max_append_entries, 50);
        assert_eq!(config.rpc_deadline, Duration::from_millis(80));
    }

    #[test]
    #[should_panic(expected = "heartbeat_interval must be less than election_timeout_min")]
    fn test_invalid_heartbeat() {
        RaftConfigBuilder::new()
            .election_timeout(Duration::from_millis(100), Duration::from_millis(200))
            .heartbeat_interval(Duration::from_millis(150))
            .build();
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_deadline_within_bounds() {
        let config = RaftConfig::default();
        for _ in 0..32 {
            let deadline = config.random_election_deadline();
            let delta = deadline - Instant::now();
            assert!(delta >= config.election_timeout_min);
            assert!(delta <= config.election_timeout_max);
        }
    }
}
