//! Ban list for discovery and transport admission
//!
//! Entries carry an absolute expiry and are purged lazily when looked up.
//! The list is bounded; once full, the least recently touched entry is
//! dropped to make room.

use crate::crypto::NodeId;
use lru::LruCache;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Default number of entries kept
pub const DEFAULT_BAN_CAPACITY: usize = 10_000;

/// Expiry used when `now + duration` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Identity a ban applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BanKey {
    Node(NodeId),
    Addr(SocketAddr),
}

impl From<NodeId> for BanKey {
    fn from(id: NodeId) -> Self {
        BanKey::Node(id)
    }
}

impl From<SocketAddr> for BanKey {
    fn from(addr: SocketAddr) -> Self {
        BanKey::Addr(addr)
    }
}

/// Banned ids and addresses with their expiry
#[derive(Debug)]
pub struct BanList {
    entries: LruCache<BanKey, Instant>,
}

impl Default for BanList {
    fn default() -> Self {
        Self::new()
    }
}

impl BanList {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BAN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Ban `key` for `duration` from now; an existing later expiry is kept
    pub fn ban(&mut self, key: impl Into<BanKey>, duration: Duration) {
        self.ban_at(key, duration, Instant::now());
    }

    pub fn ban_at(&mut self, key: impl Into<BanKey>, duration: Duration, now: Instant) {
        let until = now
            .checked_add(duration)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        let key = key.into();
        match self.entries.get_mut(&key) {
            Some(entry) => {
                if *entry < until {
                    *entry = until;
                }
            }
            None => {
                self.entries.put(key, until);
            }
        }
    }

    pub fn is_banned(&mut self, key: impl Into<BanKey>) -> bool {
        self.is_banned_at(key, Instant::now())
    }

    pub fn is_banned_at(&mut self, key: impl Into<BanKey>, now: Instant) -> bool {
        let key = key.into();
        match self.entries.peek(&key).copied() {
            Some(until) if until > now => true,
            Some(_) => {
                self.entries.pop(&key);
                false
            }
            None => false,
        }
    }

    pub fn unban(&mut self, key: impl Into<BanKey>) -> bool {
        self.entries.pop(&key.into()).is_some()
    }

    /// Number of entries, expired ones included until next lookup
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_by_id_and_addr() {
        let mut bans = BanList::new();
        let id = NodeId::random();
        let addr: SocketAddr = "127.0.0.1:30303".parse().unwrap();

        bans.ban(id, Duration::from_secs(300));
        bans.ban(addr, Duration::from_secs(300));

        assert!(bans.is_banned(id));
        assert!(bans.is_banned(addr));
        assert!(!bans.is_banned(NodeId::random()));
        assert!(!bans.is_banned("127.0.0.1:30304".parse::<SocketAddr>().unwrap()));
    }

    #[test]
    fn test_ban_expires_lazily() {
        let mut bans = BanList::new();
        let id = NodeId::random();
        let now = Instant::now();

        bans.ban_at(id, Duration::from_secs(10), now);
        assert!(bans.is_banned_at(id, now + Duration::from_secs(9)));
        assert_eq!(bans.len(), 1);

        assert!(!bans.is_banned_at(id, now + Duration::from_secs(10)));
        assert!(bans.is_empty());
    }

    #[test]
    fn test_longer_ban_wins() {
        let mut bans = BanList::new();
        let id = NodeId::random();
        let now = Instant::now();

        bans.ban_at(id, Duration::from_secs(60), now);
        bans.ban_at(id, Duration::from_secs(5), now);
        assert!(bans.is_banned_at(id, now + Duration::from_secs(30)));
    }

    #[test]
    fn test_unban() {
        let mut bans = BanList::new();
        let id = NodeId::random();
        bans.ban(id, Duration::from_secs(60));
        assert!(bans.unban(id));
        assert!(!bans.is_banned(id));
    }

    #[test]
    fn test_capacity_bounds_entries() {
        let mut bans = BanList::with_capacity(3);
        let now = Instant::now();
        let first: SocketAddr = "10.0.0.1:30303".parse().unwrap();

        bans.ban_at(first, Duration::from_secs(60), now);
        for port in 1..=5u16 {
            let addr = SocketAddr::from(([10, 0, 0, 2], port));
            bans.ban_at(addr, Duration::from_secs(60), now);
        }

        assert_eq!(bans.len(), 3);
        assert_eq!(bans.capacity(), 3);
        // Oldest entry made room for the newer ones
        assert!(!bans.is_banned_at(first, now));
        assert!(bans.is_banned_at(SocketAddr::from(([10, 0, 0, 2], 5)), now));
    }

    #[test]
    fn test_huge_duration_does_not_overflow() {
        let mut bans = BanList::new();
        let id = NodeId::random();
        let now = Instant::now();

        bans.ban_at(id, Duration::MAX, now);
        assert!(bans.is_banned_at(id, now + Duration::from_secs(365 * 24 * 60 * 60)));
    }
}
