//! Counters describing how the cache has been working.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub(crate) struct Counters {
    fetches: AtomicU64,
    coalesced: AtomicU64,
    retries: AtomicU64,
    loaded: AtomicU64,
    failed: AtomicU64,
    evictions: AtomicU64,
    stale: AtomicU64,
}

impl Counters {
    pub fn fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn loaded(&self) {
        self.loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            loaded: self.loaded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Page fetches dispatched (first attempts only).
    pub fetches: u64,
    /// Requests that joined a fetch already in flight.
    pub coalesced: u64,
    pub retries: u64,
    pub loaded: u64,
    pub failed: u64,
    pub evictions: u64,
    /// Completions dropped because the thread changed underneath them.
    pub stale: u64,
}

impl CacheStats {
    /// Share of requests served without a new fetch.
    pub fn coalesce_rate(&self) -> f64 {
        let total = self.fetches + self.coalesced;
        if total == 0 {
            0.0
        } else {
            self.coalesced as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let counters = Counters::default();
        counters.fetch();
        counters.fetch();
        counters.coalesced();
        counters.evicted();

        let stats = counters.snapshot();
        assert_eq!(stats.fetches, 2);
        assert_eq!(stats.coalesced, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.loaded, 0);
        assert!((stats.coalesce_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_rate() {
        assert_eq!(CacheStats::default().coalesce_rate(), 0.0);
    }
}
