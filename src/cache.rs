//! Bounded LRU caches with TTL, version tags, and cleanup disposers.
//!
//! Backs the picker, checker, and address caches. An entry is only a hit
//! while its version tag matches and its TTL has not elapsed; every
//! eviction path runs the entry's registered cleanup deterministically.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// Teardown hook run when an entry leaves the cache.
pub type Cleanup = Box<dyn FnOnce() + Send>;

struct Entry<Ver, V> {
    version: Ver,
    value: V,
    created: Instant,
    cleanup: Option<Cleanup>,
}

impl<Ver, V> Entry<Ver, V> {
    fn dispose(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// LRU cache keyed by `K` with a per-entry version tag.
///
/// `get_or_create` provides `(key, version, factory)`; when the stored
/// entry's version differs from `version` (or the entry is older than
/// the TTL), the old entry is evicted, its cleanup runs, and the
/// factory is re-invoked.
pub struct VersionedCache<K, Ver, V> {
    inner: Mutex<LruCache<K, Entry<Ver, V>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, Ver, V> VersionedCache<K, Ver, V>
where
    K: Hash + Eq,
    Ver: PartialEq,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached value for `key` at `version`, creating it on
    /// miss, version mismatch, or TTL expiry.
    ///
    /// The factory returns the value plus an optional cleanup invoked
    /// when the entry is later evicted.
    pub fn get_or_create<E, F>(&self, key: K, version: Ver, factory: F) -> Result<V, E>
    where
        K: Clone,
        F: FnOnce() -> Result<(V, Option<Cleanup>), E>,
    {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(entry) = inner.get(&key) {
            if entry.version == version && entry.created.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.value.clone());
            }
            // Stale: evict and fall through to the factory.
            if let Some(stale) = inner.pop(&key) {
                stale.dispose();
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let (value, cleanup) = factory()?;
        let entry = Entry {
            version,
            value: value.clone(),
            created: Instant::now(),
            cleanup,
        };
        if let Some((_, displaced)) = inner.push(key, entry) {
            displaced.dispose();
        }
        Ok(value)
    }

    /// Returns the value for `key` without checking freshness.
    pub fn peek(&self, key: &K) -> Option<V> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.get(key).map(|e| e.value.clone())
    }

    /// Removes an entry, running its cleanup.
    pub fn purge(&self, key: &K) {
        let popped = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.pop(key)
        };
        if let Some(entry) = popped {
            entry.dispose();
        }
    }

    /// Drops every entry, running all cleanups.
    pub fn clear(&self) {
        let entries: Vec<Entry<Ver, V>> = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut drained = Vec::with_capacity(inner.len());
            while let Some((_, entry)) = inner.pop_lru() {
                drained.push(entry);
            }
            drained
        };
        for entry in entries {
            entry.dispose();
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns (hits, misses).
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
