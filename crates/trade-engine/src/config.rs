//! Engine configuration
//!
//! Assembled from two sources:
//! 1. `.env` — node identity (private key, node address)
//! 2. `trade.toml` — protocol settings (fees, timeouts, data dir)
//!
//! Every toml field has a default so a missing file still yields a working
//! configuration for local runs and tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Protocol settings from trade.toml
#[derive(Debug, Clone, Deserialize)]
struct TradeToml {
    #[serde(default = "default_tx_fee")]
    tx_fee: u64,
    #[serde(default = "default_ack_timeout_secs")]
    ack_timeout_secs: u64,
    #[serde(default = "default_broadcast_timeout_secs")]
    broadcast_timeout_secs: u64,
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default = "default_seen_message_cap")]
    seen_message_cap: usize,
}

fn default_tx_fee() -> u64 {
    1_000
}

fn default_ack_timeout_secs() -> u64 {
    crate::messaging::ACK_TIMEOUT.as_secs()
}

fn default_broadcast_timeout_secs() -> u64 {
    30
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./trade-data")
}

fn default_seen_message_cap() -> usize {
    1024
}

impl Default for TradeToml {
    fn default() -> Self {
        Self {
            tx_fee: default_tx_fee(),
            ack_timeout_secs: default_ack_timeout_secs(),
            broadcast_timeout_secs: default_broadcast_timeout_secs(),
            data_dir: default_data_dir(),
            seen_message_cap: default_seen_message_cap(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    // From .env
    pub node_address: String,
    pub private_key_bytes: [u8; 32],

    // From trade.toml
    pub tx_fee: u64,
    pub ack_timeout_secs: u64,
    pub broadcast_timeout_secs: u64,
    pub data_dir: PathBuf,
    pub seen_message_cap: usize,
}

impl EngineConfig {
    /// Load configuration from env vars + trade.toml
    pub fn load<P: AsRef<Path>>(toml_path: P) -> Result<Self> {
        let toml_path = toml_path.as_ref();
        let settings: TradeToml = if toml_path.exists() {
            let raw = fs::read_to_string(toml_path)
                .with_context(|| format!("Failed to read {}", toml_path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", toml_path.display()))?
        } else {
            TradeToml::default()
        };

        let node_address = std::env::var("TRADER_NODE_ADDRESS")
            .map_err(|_| anyhow!("TRADER_NODE_ADDRESS env var is required"))?;

        let private_key_base58 = std::env::var("TRADER_PRIVATE_KEY")
            .map_err(|_| anyhow!("TRADER_PRIVATE_KEY env var is required"))?;
        let private_key_bytes = decode_private_key(&private_key_base58)?;

        Ok(Self {
            node_address,
            private_key_bytes,
            tx_fee: settings.tx_fee,
            ack_timeout_secs: settings.ack_timeout_secs,
            broadcast_timeout_secs: settings.broadcast_timeout_secs,
            data_dir: settings.data_dir,
            seen_message_cap: settings.seen_message_cap,
        })
    }

    /// Configuration for a locally wired node (simulation, tests)
    pub fn local(node_address: impl Into<String>, private_key_bytes: [u8; 32]) -> Self {
        let defaults = TradeToml::default();
        Self {
            node_address: node_address.into(),
            private_key_bytes,
            tx_fee: defaults.tx_fee,
            ack_timeout_secs: defaults.ack_timeout_secs,
            broadcast_timeout_secs: defaults.broadcast_timeout_secs,
            data_dir: defaults.data_dir,
            seen_message_cap: defaults.seen_message_cap,
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.broadcast_timeout_secs)
    }
}

/// Decode a base58 Ed25519 private key to a 32-byte seed.
///
/// Accepts either a 32-byte seed or a 64-byte seed+pubkey pair (the first 32
/// bytes are the seed).
pub fn decode_private_key(base58_key: &str) -> Result<[u8; 32]> {
    let key_bytes = bs58::decode(base58_key.trim())
        .into_vec()
        .map_err(|e| anyhow!("Failed to decode base58 private key: {}", e))?;

    if key_bytes.len() < 32 {
        return Err(anyhow!(
            "Private key too short: expected at least 32 bytes, got {}",
            key_bytes.len()
        ));
    }

    let mut arr = [0u8; 32];
    arr.copy_from_slice(&key_bytes[..32]);
    Ok(arr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_defaults() {
        let settings: TradeToml = toml::from_str("").unwrap();
        assert_eq!(settings.tx_fee, 1_000);
        assert_eq!(settings.ack_timeout_secs, 60);
        assert_eq!(settings.broadcast_timeout_secs, 30);
        assert_eq!(settings.seen_message_cap, 1024);
    }

    #[test]
    fn test_toml_overrides() {
        let settings: TradeToml = toml::from_str("tx_fee = 250\nack_timeout_secs = 5").unwrap();
        assert_eq!(settings.tx_fee, 250);
        assert_eq!(settings.ack_timeout_secs, 5);
        assert_eq!(settings.broadcast_timeout_secs, 30);
    }

    #[test]
    fn test_decode_private_key_lengths() {
        let seed = [7u8; 32];
        let encoded = bs58::encode(seed).into_string();
        assert_eq!(decode_private_key(&encoded).unwrap(), seed);

        let mut pair = [0u8; 64];
        pair[..32].copy_from_slice(&seed);
        let encoded_pair = bs58::encode(pair).into_string();
        assert_eq!(decode_private_key(&encoded_pair).unwrap(), seed);

        let short = bs58::encode([1u8; 8]).into_string();
        assert!(decode_private_key(&short).is_err());
        assert!(decode_private_key("0OIl").is_err());
    }

    #[test]
    fn test_local_config() {
        let config = EngineConfig::local("node-a:9999", [1; 32]);
        assert_eq!(config.node_address, "node-a:9999");
        assert_eq!(config.ack_timeout(), Duration::from_secs(60));
        assert_eq!(config.broadcast_timeout(), Duration::from_secs(30));
    }
}
