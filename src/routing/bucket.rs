//! K-bucket: fixed-capacity list of peers within one distance range

use super::record::PeerRecord;
use crate::crypto::NodeId;
use std::time::Instant;

/// Peers at one distance from the local node, most recently seen first
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    peers: Vec<PeerRecord>,
}

impl Bucket {
    pub fn new() -> Self {
        Self { peers: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self, k: usize) -> bool {
        self.peers.len() >= k
    }

    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.iter().any(|p| &p.id == id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| &p.id == id)
    }

    /// Least recently seen peer, the eviction candidate
    pub fn oldest(&self) -> Option<&PeerRecord> {
        self.peers.last()
    }

    /// Insert at the most recently seen position (assumes not full)
    pub(crate) fn push_front(&mut self, peer: PeerRecord) {
        self.peers.insert(0, peer);
    }

    /// Move an existing peer to the front, refreshing its endpoint
    pub(crate) fn refresh(&mut self, peer: &PeerRecord, now: Instant) -> bool {
        match self.remove(&peer.id) {
            Some(mut existing) => {
                existing.endpoint = peer.endpoint;
                existing.last_seen = now;
                self.peers.insert(0, existing);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&mut self, id: &NodeId) -> Option<PeerRecord> {
        self.peers
            .iter()
            .position(|p| &p.id == id)
            .map(|pos| self.peers.remove(pos))
    }
}
