//! Kademlia routing table
//!
//! Buckets are indexed by the length of the common prefix between the
//! Keccak-256 hashes of the local and the remote node id. The table performs
//! no I/O: a full bucket is reported back to the caller, who decides whether
//! the least recently seen entry is still alive.

use super::bucket::Bucket;
use super::record::PeerRecord;
use crate::crypto::NodeId;
use std::cmp::Reverse;
use std::time::Instant;

/// Peers per bucket (k)
pub const BUCKET_SIZE: usize = 16;

/// One bucket per possible common prefix length
pub const BUCKET_COUNT: usize = 256;

/// Result of adding a record to the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored in a bucket with free space
    Inserted,
    /// Already known; recency and endpoint refreshed
    Updated,
    /// Target bucket is full; `oldest` must be checked before eviction
    Full { oldest: PeerRecord },
    /// The local node itself
    Rejected,
}

/// XOR distance between two hashed ids
pub fn distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    crate::crypto::xor32(a, b)
}

/// Number of leading bits two hashed ids share, `None` when identical
pub fn common_prefix_len(a: &[u8; 32], b: &[u8; 32]) -> Option<usize> {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let xor = x ^ y;
        if xor != 0 {
            return Some(i * 8 + xor.leading_zeros() as usize);
        }
    }
    None
}

/// In-memory Kademlia table of verified peers
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    local_hash: [u8; 32],
    buckets: Vec<Bucket>,
    k: usize,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self::with_bucket_size(local_id, BUCKET_SIZE)
    }

    pub fn with_bucket_size(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            local_hash: local_id.hash(),
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::new()).collect(),
            k,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Bucket a remote id belongs in
    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        common_prefix_len(&self.local_hash, &id.hash())
    }

    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index)
    }

    /// Add a verified record
    pub fn add(&mut self, record: PeerRecord) -> AddOutcome {
        let Some(index) = self.bucket_index(&record.id) else {
            return AddOutcome::Rejected;
        };
        let k = self.k;
        let bucket = &mut self.buckets[index];

        if bucket.refresh(&record, record.last_seen.max(Instant::now())) {
            return AddOutcome::Updated;
        }
        if bucket.is_full(k) {
            // is_full implies non-empty
            return match bucket.oldest() {
                Some(oldest) => AddOutcome::Full {
                    oldest: oldest.clone(),
                },
                None => AddOutcome::Rejected,
            };
        }
        bucket.push_front(record);
        AddOutcome::Inserted
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<PeerRecord> {
        let index = self.bucket_index(id)?;
        self.buckets[index].remove(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerRecord> {
        let index = self.bucket_index(id)?;
        self.buckets[index].get(id)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Bucket::is_empty)
    }

    /// All known records
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.buckets
            .iter()
            .flat_map(|b| b.peers().iter().cloned())
            .collect()
    }

    /// The `n` records nearest to `target`, most recently seen first on ties
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<PeerRecord> {
        let target_hash = target.hash();
        let mut ranked: Vec<([u8; 32], PeerRecord)> = self
            .buckets
            .iter()
            .flat_map(|b| b.peers().iter())
            .map(|p| (distance(&p.id.hash(), &target_hash), p.clone()))
            .collect();
        ranked.sort_by_key(|(dist, p)| (*dist, Reverse(p.last_seen)));
        ranked.into_iter().take(n).map(|(_, p)| p).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Endpoint;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn record(id: NodeId, port: u16) -> PeerRecord {
        PeerRecord::new(
            id,
            Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, Some(port)),
        )
    }

    /// Random ids that all land in the same bucket of `table`
    fn ids_in_bucket(table: &RoutingTable, index: usize, count: usize) -> Vec<NodeId> {
        let mut ids = Vec::new();
        while ids.len() < count {
            let id = NodeId::random();
            if table.bucket_index(&id) == Some(index) {
                ids.push(id);
            }
        }
        ids
    }

    #[test]
    fn test_add_and_contains() {
        let mut table = RoutingTable::new(NodeId::random());
        let id = NodeId::random();

        assert_eq!(table.add(record(id, 30303)), AddOutcome::Inserted);
        assert!(table.contains(&id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_readd_updates_recency_not_count() {
        let mut table = RoutingTable::new(NodeId::random());
        let ids = ids_in_bucket(&table, 0, 2);

        table.add(record(ids[0], 1));
        table.add(record(ids[1], 2));
        // ids[1] is now most recent
        assert_eq!(table.bucket(0).unwrap().peers()[0].id, ids[1]);

        assert_eq!(table.add(record(ids[0], 3)), AddOutcome::Updated);
        assert_eq!(table.len(), 2);
        let front = &table.bucket(0).unwrap().peers()[0];
        assert_eq!(front.id, ids[0]);
        assert_eq!(front.endpoint.udp_port, 3);
    }

    #[test]
    fn test_never_stores_local_id() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local);
        assert_eq!(table.add(record(local, 1)), AddOutcome::Rejected);
        assert!(table.is_empty());
    }

    #[test]
    fn test_full_bucket_reports_oldest() {
        let mut table = RoutingTable::with_bucket_size(NodeId::random(), 4);
        let ids = ids_in_bucket(&table, 0, 5);

        for (i, id) in ids[..4].iter().enumerate() {
            assert_eq!(table.add(record(*id, i as u16)), AddOutcome::Inserted);
        }

        match table.add(record(ids[4], 99)) {
            AddOutcome::Full { oldest } => assert_eq!(oldest.id, ids[0]),
            other => panic!("expected full bucket, got {:?}", other),
        }
        assert!(!table.contains(&ids[4]));
        assert_eq!(table.len(), 4);

        // Evicting the oldest makes room
        assert!(table.remove(&ids[0]).is_some());
        assert_eq!(table.add(record(ids[4], 99)), AddOutcome::Inserted);
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_remove() {
        let mut table = RoutingTable::new(NodeId::random());
        let id = NodeId::random();
        table.add(record(id, 1));

        assert!(table.remove(&id).is_some());
        assert!(table.remove(&id).is_none());
        assert!(!table.contains(&id));
    }

    #[test]
    fn test_closest_orders_by_distance() {
        let mut table = RoutingTable::new(NodeId::random());
        let ids: Vec<NodeId> = (0..12).map(|_| NodeId::random()).collect();
        for (i, id) in ids.iter().enumerate() {
            table.add(record(*id, i as u16));
        }

        let target = NodeId::random();
        let closest = table.closest(&target, 5);
        assert_eq!(closest.len(), 5.min(table.len()));

        let target_hash = target.hash();
        for pair in closest.windows(2) {
            assert!(
                distance(&pair[0].id.hash(), &target_hash)
                    <= distance(&pair[1].id.hash(), &target_hash)
            );
        }

        // The nearest record overall comes first
        let best = table
            .peers()
            .into_iter()
            .min_by_key(|p| distance(&p.id.hash(), &target_hash))
            .unwrap();
        assert_eq!(closest[0].id, best.id);
    }

    #[test]
    fn test_closest_prefers_exact_target() {
        let mut table = RoutingTable::new(NodeId::random());
        let id = NodeId::random();
        table.add(record(id, 1));
        table.add(record(NodeId::random(), 2));

        assert_eq!(table.closest(&id, 1)[0].id, id);
    }

    #[test]
    fn test_common_prefix_len() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(common_prefix_len(&a, &b), None);
        b[0] = 0x80;
        assert_eq!(common_prefix_len(&a, &b), Some(0));
        b[0] = 0;
        b[1] = 0x01;
        assert_eq!(common_prefix_len(&a, &b), Some(15));
    }

    #[test]
    fn test_refresh_sets_last_seen() {
        let mut table = RoutingTable::new(NodeId::random());
        let id = NodeId::random();
        let mut old = record(id, 1);
        old.last_seen = Instant::now() - Duration::from_secs(60);
        table.add(old.clone());

        table.add(record(id, 1));
        assert!(table.get(&id).unwrap().last_seen > old.last_seen);
    }
}
