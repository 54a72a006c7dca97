//! Node discovery
//!
//! This module provides:
//! - Signed UDP packet encoding (PING, PONG, FINDNEIGHBOURS, NEIGHBOURS)
//! - A time-bounded ban list keyed by node id or socket address
//! - The discovery service that verifies candidates and walks the network

pub mod ban_list;
pub mod message;
pub mod service;

pub use ban_list::{BanKey, BanList};
pub use message::{Message, Packet, PacketError};
pub use service::{Discovery, DiscoveryConfig, DiscoveryError, DiscoveryEvent};
