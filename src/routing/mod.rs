//! Routing table for node discovery
//!
//! A pure, I/O-free Kademlia structure of verified peer records. The
//! discovery service owns one and performs the network side effects
//! (liveness pings, evictions) around it.

pub mod bucket;
pub mod record;
pub mod table;

pub use bucket::Bucket;
pub use record::{Endpoint, PeerRecord};
pub use table::{common_prefix_len, distance, AddOutcome, RoutingTable, BUCKET_COUNT, BUCKET_SIZE};
