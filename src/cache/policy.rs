//! Replaceable eviction ordering for the block cache.

use std::collections::{HashSet, VecDeque};

use super::CacheKey;

/// Decides which resident entry gets evicted next.
///
/// The cache records membership changes; `pop_victim` hands back the next
/// candidate in policy order. Entries the cache pulls out for flushing are
/// re-registered once clean again.
pub trait EvictionPolicy: Send {
    fn record_insert(&mut self, key: CacheKey);
    fn record_access(&mut self, key: CacheKey);
    fn record_remove(&mut self, key: CacheKey);
    fn pop_victim(&mut self) -> Option<CacheKey>;
}

/// Insertion-order FIFO, the simplest policy consistent with flush ordering.
#[derive(Default)]
pub struct FifoPolicy {
    order: VecDeque<CacheKey>,
    members: HashSet<CacheKey>,
}

impl FifoPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionPolicy for FifoPolicy {
    fn record_insert(&mut self, key: CacheKey) {
        if self.members.insert(key) {
            self.order.push_back(key);
        }
    }

    fn record_access(&mut self, _key: CacheKey) {}

    fn record_remove(&mut self, key: CacheKey) {
        // Lazy removal; stale queue entries are skipped in pop_victim.
        self.members.remove(&key);
    }

    fn pop_victim(&mut self) -> Option<CacheKey> {
        while let Some(key) = self.order.pop_front() {
            if self.members.remove(&key) {
                return Some(key);
            }
        }
        None
    }
}
