//! # Bounded Cache
//!
//! This module provides the in-memory payload store. The cache is bounded by
//! entry count and self-evicting: an insertion that crosses the capacity
//! evicts a batch of the least-recently-used entries (roughly
//! `1/clearance_factor` of the store) rather than a single entry, amortizing
//! eviction cost across many insertions.
//!
//! Recency is tracked with a monotone tick counter instead of wall-clock
//! timestamps, so the eviction order is total and deterministic even when
//! many operations land within the same clock quantum.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

/// Entry in the cache
struct CacheEntry {
    /// Cached payload bytes
    payload: Bytes,
    /// Tick of the last successful access (insert or read)
    last_access: u64,
}

/// A capacity-bounded key/payload store with recency-based batch eviction.
///
/// All entry mutations, including the recency bump performed by [`get`],
/// run under one coarse lock; eviction needs a global recency ordering, so
/// per-key locking would buy nothing here. The capacity itself is an atomic
/// field and is deliberately not linearized with entry mutations.
///
/// [`get`]: BoundedCache::get
pub struct BoundedCache {
    /// Key to entry map, guarded by a single coarse lock
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// Maximum number of entries; reads/writes are racy by design
    capacity: AtomicUsize,
    /// Eviction batch divisor, fixed at construction
    clearance_factor: usize,
    /// Monotone access counter
    tick: AtomicU64,
}

impl BoundedCache {
    /// Create a new cache.
    ///
    /// `capacity` is clamped to at least 1 and `clearance_factor` to at
    /// least 2.
    pub fn new(capacity: usize, clearance_factor: usize) -> Self {
        let capacity = capacity.max(1);
        let clearance_factor = clearance_factor.max(2);

        debug!(capacity, clearance_factor, "bounded cache created");

        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: AtomicUsize::new(capacity),
            clearance_factor,
            tick: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or replace the payload for `key`, evicting a batch of the
    /// least-recently-used entries if the store crossed its capacity.
    pub fn put(&self, key: impl Into<String>, payload: Bytes) {
        let key = key.into();
        let capacity = self.capacity.load(Ordering::Relaxed);

        let mut entries = self.entries.lock();
        let tick = self.next_tick();
        entries.insert(
            key,
            CacheEntry {
                payload,
                last_access: tick,
            },
        );

        let len = entries.len();
        if len > capacity {
            // Evict the larger of the overflow and len/clearance_factor,
            // oldest first. The just-inserted entry carries the newest tick
            // and can never fall into the batch (factor >= 2).
            let batch = (len - capacity).max(len / self.clearance_factor);

            let mut order: Vec<(u64, String)> = entries
                .iter()
                .map(|(k, e)| (e.last_access, k.clone()))
                .collect();
            order.sort_unstable();

            for (_, stale) in order.into_iter().take(batch) {
                entries.remove(&stale);
            }

            debug!(
                evicted = batch,
                remaining = entries.len(),
                capacity,
                "cache over capacity, evicted least-recently-used batch"
            );
        }
    }

    /// Look up the payload for `key`, bumping its recency on a hit.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.last_access = self.next_tick();
        Some(entry.payload.clone())
    }

    /// Remove the entry for `key` if present.
    pub fn remove(&self, key: &str) {
        if self.entries.lock().remove(key).is_some() {
            debug!(key, "removed entry from cache");
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        if !entries.is_empty() {
            debug!(dropped = entries.len(), "cache cleared");
            entries.clear();
        }
    }

    /// Current number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Update the capacity for future insertions. Existing entries are not
    /// retroactively evicted; values below 1 are clamped to 1.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }
}
