//! Bounded membership cache of recently sent transaction ids.
//!
//! Each peer record tracks the ids it has recently sent to (or received
//! from) the remote so the same transaction is never re-selected for that
//! peer. Insert and lookup are O(1) amortized; the least-recently-touched id
//! is evicted once capacity is exceeded. No iteration is required.
//!
//! # Design
//!
//! Ids map to a monotonically increasing touch stamp; a queue of
//! `(stamp, id)` pairs records touch order. Re-touching an id pushes a fresh
//! queue entry and bumps the map stamp, leaving the old queue entry stale.
//! Eviction pops queue entries from the front, skipping stale ones, and the
//! queue is compacted once it grows past twice the capacity.

use std::collections::{HashMap, VecDeque};
use spate_core::types::TxId;

/// LRU set of recently sent transaction ids.
#[derive(Clone, Debug)]
pub struct RecentTransactions {
    capacity: usize,
    next_stamp: u64,
    stamps: HashMap<TxId, u64>,
    queue: VecDeque<(u64, TxId)>,
}

impl RecentTransactions {
    /// Create a cache holding at most `capacity` distinct ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_stamp: 0,
            stamps: HashMap::with_capacity(capacity.min(1024)),
            queue: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Record that `id` was just sent. Idempotent: re-adding refreshes the
    /// id's recency without growing the set.
    pub fn add(&mut self, id: TxId) {
        self.next_stamp += 1;
        let stamp = self.next_stamp;
        self.stamps.insert(id, stamp);
        self.queue.push_back((stamp, id));

        if self.queue.len() > self.capacity * 2 {
            self.compact();
        }
        while self.stamps.len() > self.capacity {
            self.evict_oldest();
        }
    }

    /// Whether any of the last `capacity` distinct adds included `id`.
    pub fn contains(&self, id: &TxId) -> bool {
        self.stamps.contains_key(id)
    }

    /// Number of distinct ids currently tracked.
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    fn evict_oldest(&mut self) {
        while let Some((stamp, id)) = self.queue.pop_front() {
            // skip queue entries superseded by a later touch
            if self.stamps.get(&id) == Some(&stamp) {
                self.stamps.remove(&id);
                return;
            }
        }
    }

    fn compact(&mut self) {
        let stamps = &self.stamps;
        self.queue.retain(|(stamp, id)| stamps.get(id) == Some(stamp));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> TxId {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&n.to_le_bytes());
        TxId(bytes)
    }

    #[test]
    fn add_then_contains() {
        let mut cache = RecentTransactions::new(10);
        cache.add(id(1));
        assert!(cache.contains(&id(1)));
        assert!(!cache.contains(&id(2)));
    }

    #[test]
    fn double_add_is_idempotent() {
        let mut cache = RecentTransactions::new(10);
        cache.add(id(1));
        cache.add(id(1));
        assert!(cache.contains(&id(1)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_least_recently_touched() {
        let mut cache = RecentTransactions::new(3);
        cache.add(id(1));
        cache.add(id(2));
        cache.add(id(3));
        // touch 1 so 2 becomes the oldest
        cache.add(id(1));
        cache.add(id(4));
        assert!(!cache.contains(&id(2)), "oldest untouched id should be evicted");
        assert!(cache.contains(&id(1)));
        assert!(cache.contains(&id(3)));
        assert!(cache.contains(&id(4)));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut cache = RecentTransactions::new(100);
        for n in 0..10_000u64 {
            cache.add(id(n));
            assert!(cache.len() <= 100);
        }
        // the most recent 100 survive
        for n in 9_900..10_000u64 {
            assert!(cache.contains(&id(n)));
        }
        assert!(!cache.contains(&id(0)));
    }

    #[test]
    fn queue_stays_bounded_under_retouch() {
        let mut cache = RecentTransactions::new(50);
        for _ in 0..10_000 {
            cache.add(id(1));
        }
        assert_eq!(cache.len(), 1);
        assert!(
            cache.queue.len() <= 101,
            "stale queue entries must be compacted, got {}",
            cache.queue.len()
        );
    }
}
