// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process memory tier.
//!
//! A `DashMap` bounded by entry count and, optionally, by entry age. When an
//! insert would exceed capacity the least recently used entry is evicted;
//! expired entries are dropped lazily on read and in bulk by
//! [`CacheLayer::purge_expired`].
//!
//! Entries carry a `dirty` flag: `true` until the remote tier has confirmed
//! the value. Evicting a dirty entry loses nothing, the local store holds
//! the durable copy.
//!
//! Writers use [`CacheLayer::put`] and [`CacheLayer::remove`], which bump a
//! write generation. Readers that populate the cache from a lower tier take
//! [`CacheLayer::generation`] before the lookup and hand it to
//! [`CacheLayer::fill`], which refuses the insert if any write landed in
//! between, so a slow read never shadows a newer write.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::key::StorageKey;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    /// `None` when the cache has no TTL
    pub expires_at: Option<Instant>,
    /// Not yet confirmed by the remote tier
    pub dirty: bool,
    last_access: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Cache counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub dirty: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

pub struct CacheLayer {
    entries: DashMap<StorageKey, CacheEntry>,
    max_entries: usize,
    ttl: Option<Duration>,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    /// Serializes capacity check + eviction with the insert it guards
    write_lock: Mutex<()>,
    /// Bumped by every write-path mutation
    generation: AtomicU64,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheLayer {
    #[must_use]
    pub fn new(max_entries: usize, ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            ttl,
            clock: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, key: &StorageKey) -> Option<Value> {
        let now = Instant::now();
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.last_access = self.tick();
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup(true);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired && self.entries.remove_if(key, |_, e| e.is_expired(now)).is_some() {
            self.expirations.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(false);
        None
    }

    /// Current write generation, taken by readers before a lookup.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Insert or replace, evicting the least recently used entry if full.
    pub fn put(&self, key: StorageKey, value: Value, dirty: bool) {
        let _guard = self.write_lock.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.insert_locked(key, value, dirty);
    }

    /// Populate from a lower tier. Skipped when the key is already cached or
    /// any write happened since `seen` was taken from [`Self::generation`].
    pub fn fill(&self, key: StorageKey, value: Value, dirty: bool, seen: u64) -> bool {
        let _guard = self.write_lock.lock();
        if self.generation.load(Ordering::Acquire) != seen || self.entries.contains_key(&key) {
            trace!(key = %key, "Stale read, cache fill skipped");
            return false;
        }
        self.insert_locked(key, value, dirty);
        true
    }

    fn insert_locked(&self, key: StorageKey, value: Value, dirty: bool) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_lru(self.entries.len() + 1 - self.max_entries);
        }

        let entry = CacheEntry {
            value,
            expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
            dirty,
            last_access: self.tick(),
        };
        self.entries.insert(key, entry);
        crate::metrics::set_cache_entries(self.entries.len());
    }

    pub fn remove(&self, key: &StorageKey) -> bool {
        let _guard = self.write_lock.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let removed = self.entries.remove(key).is_some();
        if removed {
            crate::metrics::set_cache_entries(self.entries.len());
        }
        removed
    }

    /// Flag an entry as confirmed by the remote tier.
    pub fn mark_clean(&self, key: &StorageKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.dirty = false;
        }
    }

    #[must_use]
    pub fn is_dirty(&self, key: &StorageKey) -> Option<bool> {
        self.entries.get(key).map(|e| e.dirty)
    }

    #[must_use]
    pub fn contains(&self, key: &StorageKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
            crate::metrics::set_cache_entries(self.entries.len());
        }
        purged
    }

    /// Evict up to `count` least recently used entries (quota relief).
    pub fn evict_oldest(&self, count: usize) -> usize {
        let _guard = self.write_lock.lock();
        self.evict_lru(count)
    }

    fn evict_lru(&self, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let mut by_age: Vec<(u64, StorageKey)> = self
            .entries
            .iter()
            .map(|e| (e.value().last_access, e.key().clone()))
            .collect();
        by_age.sort_unstable_by_key(|(access, _)| *access);

        let mut evicted = 0;
        for (_, key) in by_age.into_iter().take(count) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            crate::metrics::record_eviction("cache", evicted);
            crate::metrics::set_cache_entries(self.entries.len());
            trace!(evicted, "Evicted least recently used cache entries");
        }
        evicted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.clear();
        crate::metrics::set_cache_entries(0);
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            dirty: self.entries.iter().filter(|e| e.value().dirty).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}
