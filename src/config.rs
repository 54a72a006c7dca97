//! Node configuration
//!
//! A single JSON document describes a node: its identity, where it listens,
//! how it discovers and admits peers and which chain it announces in SEC
//! status messages. Missing fields take their defaults.

use crate::crypto::{KeyError, KeyPair};
use crate::discovery::DiscoveryConfig;
use crate::rlpx::RlpxConfig;
use crate::routing::Endpoint;
use crate::sec::Status;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid hash: {0}")]
    InvalidHash(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

/// Everything needed to start a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hex secp256k1 secret; a fresh identity is generated when absent
    pub private_key: Option<String>,
    pub bind_address: IpAddr,
    /// Address announced to peers when it differs from the bind address
    pub advertised_address: Option<IpAddr>,
    pub udp_port: u16,
    /// RLPx listen port; `None` runs outbound-only
    pub tcp_port: Option<u16>,
    /// Discovery seeds as `ip:udp-port`
    pub bootnodes: Vec<String>,
    pub max_peers: usize,
    pub client_id: Option<String>,
    pub client_filter: Vec<String>,
    pub refresh_interval_secs: u64,
    pub discovery_timeout_secs: u64,
    pub ban_duration_secs: u64,
    pub network_id: u64,
    pub chain_id: u64,
    /// Hex genesis hash announced in STATUS
    pub genesis_hash: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertised_address: None,
            udp_port: 30303,
            tcp_port: Some(30303),
            bootnodes: Vec::new(),
            max_peers: 10,
            client_id: None,
            client_filter: Vec::new(),
            refresh_interval_secs: 60,
            discovery_timeout_secs: 10,
            ban_duration_secs: 5 * 60,
            network_id: 1,
            chain_id: 1,
            genesis_hash: "00".repeat(32),
        }
    }
}

impl NodeConfig {
    /// Read a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the services cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "refresh_interval_secs",
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// The configured identity, or a freshly generated one
    pub fn key_pair(&self) -> Result<KeyPair, ConfigError> {
        match &self.private_key {
            Some(hex_key) => Ok(KeyPair::from_private_key_hex(hex_key)?),
            None => Ok(KeyPair::generate()),
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            bind_addr: SocketAddr::new(self.bind_address, self.udp_port),
            advertised_address: self.advertised_address,
            tcp_port: self.tcp_port,
            timeout: Duration::from_secs(self.discovery_timeout_secs),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            ban_duration: Duration::from_secs(self.ban_duration_secs),
            ..Default::default()
        }
    }

    pub fn rlpx_config(&self) -> RlpxConfig {
        let defaults = RlpxConfig::default();
        RlpxConfig {
            max_peers: self.max_peers,
            client_id: self.client_id.clone().unwrap_or_else(|| defaults.client_id.clone()),
            listen_port: self.tcp_port,
            client_filter: self.client_filter.clone(),
            ..defaults
        }
    }

    /// RLPx listen address, if inbound connections are accepted
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.tcp_port
            .map(|port| SocketAddr::new(self.bind_address, port))
    }

    /// Parse the configured bootnodes
    pub fn bootnode_endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.bootnodes
            .iter()
            .map(|node| {
                node.trim()
                    .parse::<SocketAddr>()
                    .map(Endpoint::from_socket_addr)
                    .map_err(|_| ConfigError::InvalidAddress(node.clone()))
            })
            .collect()
    }

    /// STATUS announced to every peer
    pub fn status(&self) -> Result<Status, ConfigError> {
        let genesis_hash = parse_hash(&self.genesis_hash)?;
        Ok(Status {
            network_id: self.network_id,
            total_difficulty: vec![0],
            best_hash: genesis_hash,
            genesis_hash,
            chain_id: self.chain_id,
        })
    }
}

fn parse_hash(value: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(value.trim_start_matches("0x"))
        .map_err(|_| ConfigError::InvalidHash(value.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ConfigError::InvalidHash(value.to_string()))
}
