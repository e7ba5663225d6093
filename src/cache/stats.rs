use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime counters of one cache, updated lock-free.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub loads: AtomicU64,
    pub created_defaults: AtomicU64,
    pub decode_failures: AtomicU64,
    pub read_failures: AtomicU64,
    pub dropped_entries: AtomicU64,
    pub writes: AtomicU64,
    pub write_failures: AtomicU64,
    pub evictions: AtomicU64,
    pub flush_cycles: AtomicU64,
}

impl CacheCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of cache counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Entities currently resident.
    pub cached: usize,
    /// Identities queued for the next flush.
    pub dirty_queued: usize,
    /// Snapshots loaded from storage.
    pub loads: u64,
    /// Records created from defaults because no snapshot existed.
    pub created_defaults: u64,
    /// Snapshots that could not be decoded at all and were replaced by defaults.
    pub decode_failures: u64,
    /// Storage reads that failed.
    pub read_failures: u64,
    /// Individual entries dropped while decoding otherwise readable snapshots.
    pub dropped_entries: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub evictions: u64,
    pub flush_cycles: u64,
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: usize,
    /// Candidates that became dirty again while being flushed and were kept.
    pub kept_dirty: usize,
    pub failed: usize,
}
