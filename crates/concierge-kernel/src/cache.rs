use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use concierge_contracts::ChatResponse;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: ChatResponse,
    written_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.written_at) > self.ttl
    }
}

/// Fingerprint-keyed response cache with per-entry TTL and lazy expiry.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<ChatResponse> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<ChatResponse> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
            debug!(key, "evicted expired cache entry");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(&self, key: impl Into<String>, value: &ChatResponse) {
        self.set_at(key, value, self.default_ttl, Instant::now());
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: &ChatResponse, ttl: Duration) {
        self.set_at(key, value, ttl, Instant::now());
    }

    /// Stores the cache-safe copy of `value`; timing metadata never enters the cache.
    pub fn set_at(&self, key: impl Into<String>, value: &ChatResponse, ttl: Duration, now: Instant) {
        let key = key.into();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.entries.retain(|_, entry| !entry.is_expired(now));
            if self.entries.len() >= self.max_entries {
                warn!(max_entries = self.max_entries, "response cache full; clearing");
                self.entries.clear();
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value: value.for_cache(),
                written_at: now,
                ttl,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            max_entries: self.max_entries,
            ttl_seconds: self.default_ttl.as_secs(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
