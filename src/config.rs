use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::hash::HashValue;
use crate::network::peers::PeerAddress;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables loaded from an optional JSON file; any missing field keeps its default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gossip: GossipConfig,
    pub chain: ChainConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub anti_entropy_period_ms: u64,
    pub route_period_ms: u64,
    pub monger_timeout_ms: u64,
    /// Unacknowledged sends to one peer before it is evicted
    pub max_retries: u32,
    /// Probability of keeping a rumor alive after a timeout or an in-sync status
    pub continue_probability: f64,
    pub private_hop_limit: u32,
    pub channel_capacity: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            anti_entropy_period_ms: 3_000,
            route_period_ms: 3_000,
            monger_timeout_ms: 1_000,
            max_retries: 5,
            continue_probability: 0.5,
            private_hop_limit: 10,
            channel_capacity: 256,
        }
    }
}

impl GossipConfig {
    pub fn anti_entropy_period(&self) -> Duration {
        Duration::from_millis(self.anti_entropy_period_ms)
    }

    pub fn route_period(&self) -> Duration {
        Duration::from_millis(self.route_period_ms)
    }

    pub fn monger_timeout(&self) -> Duration {
        Duration::from_millis(self.monger_timeout_ms)
    }

    /// Clamped so a bad config file cannot make `gen_bool` panic
    pub fn coin_probability(&self) -> f64 {
        self.continue_probability.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Leading zero bytes a block nonce needs
    pub difficulty: usize,
    pub coinbase_reward: u32,
    pub tx_hop_limit: u32,
    pub block_hop_limit: u32,
    /// Self-mined blocks are published after `factor * mining time`
    pub publish_delay_factor: u32,
    pub miner_hash: Option<HashValue>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            difficulty: 2,
            coinbase_reward: 1,
            tx_hop_limit: 10,
            block_hop_limit: 20,
            publish_delay_factor: 2,
            miner_hash: None,
        }
    }
}

/// Everything needed to start one node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub gossip_addr: PeerAddress,
    pub peers: Vec<PeerAddress>,
    pub gossip: GossipConfig,
    pub chain: ChainConfig,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, gossip_addr: PeerAddress) -> Self {
        Self {
            name: name.into(),
            gossip_addr,
            peers: Vec::new(),
            gossip: GossipConfig::default(),
            chain: ChainConfig::default(),
        }
    }

    pub fn with_peers(mut self, peers: Vec<PeerAddress>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_tunables(mut self, config: &Config) -> Self {
        self.gossip = config.gossip.clone();
        self.chain = config.chain.clone();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"gossip": {"max_retries": 3}, "chain": {"difficulty": 1}}"#)
                .unwrap();
        assert_eq!(config.gossip.max_retries, 3);
        assert_eq!(config.gossip.monger_timeout(), Duration::from_secs(1));
        assert_eq!(config.chain.difficulty, 1);
        assert_eq!(config.chain.block_hop_limit, 20);
    }

    #[test]
    fn test_coin_probability_is_clamped() {
        let gossip = GossipConfig {
            continue_probability: 3.0,
            ..GossipConfig::default()
        };
        assert_eq!(gossip.coin_probability(), 1.0);
    }
}
