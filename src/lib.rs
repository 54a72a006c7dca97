//! sec-p2p: peer-to-peer networking for blockchain nodes
//!
//! This crate provides the full networking stack of a node:
//! - Kademlia routing table of verified peers
//! - UDP node discovery with PING/PONG verification, bans and lookups
//! - RLPx: ECIES handshake, MAC-protected frames, HELLO and DISCONNECT,
//!   slot budgeting and a back-off dial queue
//! - The SEC sub-protocol envelope: status handshake and code validation
//!
//! # Example
//!
//! ```no_run
//! use sec_p2p::discovery::{Discovery, DiscoveryConfig};
//! use sec_p2p::rlpx::{Rlpx, RlpxConfig};
//! use sec_p2p::KeyPair;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let key = KeyPair::generate();
//!
//! let discovery = Discovery::new(key.clone(), DiscoveryConfig::default());
//! discovery.bind().await?;
//!
//! let rlpx = Rlpx::new(key, RlpxConfig::default(), Some(discovery.clone()));
//! rlpx.listen("0.0.0.0:30303".parse()?).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod rlpx;
pub mod routing;
pub mod sec;

// Re-export commonly used types
pub use config::{ConfigError, NodeConfig};
pub use crypto::{KeyPair, NodeId};
pub use discovery::{Discovery, DiscoveryConfig, DiscoveryError, DiscoveryEvent};
pub use rlpx::{DisconnectReason, Peer, Rlpx, RlpxConfig, RlpxError, RlpxEvent};
pub use routing::{Endpoint, PeerRecord, RoutingTable};
pub use sec::{MessageCode, ProtocolError, Sec, SecEvent, Status};
