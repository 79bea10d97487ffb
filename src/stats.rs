//! Cache activity counters.
//!
//! [`CacheStats`] records hits, misses, evictions, and invalidations. Every
//! method takes `&self`, so one instance can be shared across all tasks and
//! components without external synchronisation. Tests assert decision paths
//! through snapshots; the dispatcher exposes them for debugging.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheStats {
    meta_hits: AtomicU64,
    meta_misses: AtomicU64,
    dir_hits: AtomicU64,
    dir_misses: AtomicU64,
    block_hits: AtomicU64,
    block_misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub meta_hits: u64,
    pub meta_misses: u64,
    pub dir_hits: u64,
    pub dir_misses: u64,
    pub block_hits: u64,
    pub block_misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl CacheStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meta_hit(&self) {
        self.meta_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn meta_miss(&self) {
        self.meta_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dir_hit(&self) {
        self.dir_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dir_miss(&self) {
        self.dir_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn block_hit(&self) {
        self.block_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn block_miss(&self) {
        self.block_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evicted(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn invalidated(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            meta_hits: self.meta_hits.load(Ordering::Relaxed),
            meta_misses: self.meta_misses.load(Ordering::Relaxed),
            dir_hits: self.dir_hits.load(Ordering::Relaxed),
            dir_misses: self.dir_misses.load(Ordering::Relaxed),
            block_hits: self.block_hits.load(Ordering::Relaxed),
            block_misses: self.block_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = CacheStats::new();
        stats.meta_hit();
        stats.meta_hit();
        stats.meta_miss();
        stats.block_hit();
        stats.evicted(3);
        stats.invalidated();

        let snap = stats.snapshot();
        assert_eq!(snap.meta_hits, 2);
        assert_eq!(snap.meta_misses, 1);
        assert_eq!(snap.block_hits, 1);
        assert_eq!(snap.block_misses, 0);
        assert_eq!(snap.evictions, 3);
        assert_eq!(snap.invalidations, 1);
    }
}
