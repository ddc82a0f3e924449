// In-process cache layer
//
// Per-category LRU map with per-entry TTL. Each category has its own size
// bound; inserting into a full category drops its expired entries, then the
// least recently used one if it is still full.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::{cache_key, CacheService, CacheStats, Scope, DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECS};

#[derive(Debug, Clone)]
struct CachedEntry {
    value: Value,
    cached_at: Instant,
    ttl: Duration,
    /// Recency tick; larger is more recent
    last_access: u64,
}

impl CachedEntry {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

#[derive(Debug, Default)]
struct Category {
    entries: HashMap<String, CachedEntry>,
    stats: CacheStats,
}

#[derive(Debug, Default)]
struct Inner {
    categories: HashMap<String, Category>,
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Bounded in-memory cache with LRU eviction and TTL
pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    default_ttl: Duration,
    ttls: HashMap<String, Duration>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECS)
    }
}

impl MemoryCache {
    /// * `max_entries` - Size bound per category
    /// * `default_ttl_secs` - TTL for categories without their own policy
    pub fn new(max_entries: usize, default_ttl_secs: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries: max_entries.max(1),
            default_ttl: Duration::from_secs(default_ttl_secs),
            ttls: HashMap::new(),
        }
    }

    pub fn with_ttls(mut self, ttls: &HashMap<String, u64>) -> Self {
        self.ttls = ttls
            .iter()
            .map(|(category, secs)| (category.clone(), Duration::from_secs(*secs)))
            .collect();
        self
    }

    pub fn ttl_for(&self, category: &str) -> Duration {
        self.ttls.get(category).copied().unwrap_or(self.default_ttl)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up by already derived key.
    pub fn get_entry(&self, category: &str, key: &str) -> Option<Value> {
        let mut inner = self.lock();
        let tick = inner.tick();
        let bucket = inner.categories.entry(category.to_string()).or_default();

        match bucket.entries.get_mut(key) {
            Some(entry) if entry.is_expired() => {
                bucket.entries.remove(key);
                bucket.stats.misses += 1;
                bucket.stats.expirations += 1;
                tracing::debug!("Memory cache expired: {}/{}", category, key);
                None
            }
            Some(entry) => {
                entry.last_access = tick;
                bucket.stats.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                bucket.stats.misses += 1;
                None
            }
        }
    }

    /// Store under an already derived key. Returns the evicted key, if any.
    ///
    /// A full category first drops its expired entries; only when none have
    /// expired is the least recently used entry evicted.
    pub fn put_entry(
        &self,
        category: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Option<String> {
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(category));
        let mut inner = self.lock();
        let tick = inner.tick();
        let bucket = inner.categories.entry(category.to_string()).or_default();

        let mut evicted = None;
        if bucket.entries.len() >= self.max_entries && !bucket.entries.contains_key(key) {
            let before = bucket.entries.len();
            bucket.entries.retain(|_, e| !e.is_expired());
            let expired = before - bucket.entries.len();
            if expired > 0 {
                bucket.stats.expirations += expired as u64;
                tracing::debug!("Dropped {} expired memory cache entries in {}", expired, category);
            }
        }

        if bucket.entries.len() >= self.max_entries && !bucket.entries.contains_key(key) {
            let victim = bucket
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                bucket.entries.remove(&victim);
                bucket.stats.evictions += 1;
                tracing::debug!("Evicted memory cache entry: {}/{}", category, victim);
                evicted = Some(victim);
            }
        }

        bucket.entries.insert(
            key.to_string(),
            CachedEntry {
                value,
                cached_at: Instant::now(),
                ttl,
                last_access: tick,
            },
        );
        bucket.stats.sets += 1;
        evicted
    }

    pub fn clear(&self, scope: Scope<'_>) -> usize {
        let mut inner = self.lock();
        let cleared = match scope {
            Scope::Category(category) => inner
                .categories
                .get_mut(category)
                .map(|bucket| {
                    let n = bucket.entries.len();
                    bucket.entries.clear();
                    n
                })
                .unwrap_or(0),
            Scope::All => inner
                .categories
                .values_mut()
                .map(|bucket| {
                    let n = bucket.entries.len();
                    bucket.entries.clear();
                    n
                })
                .sum(),
        };
        tracing::info!("Cleared {} memory cache entries", cleared);
        cleared
    }

    pub fn category_stats(&self, category: &str) -> CacheStats {
        self.lock()
            .categories
            .get(category)
            .map(|bucket| bucket.stats.clone())
            .unwrap_or_default()
    }

    /// Number of entries held for a category
    pub fn size(&self, category: &str) -> usize {
        self.lock()
            .categories
            .get(category)
            .map(|bucket| bucket.entries.len())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl CacheService for MemoryCache {
    async fn get(&self, category: &str, key_parts: &[&str]) -> Option<Value> {
        self.get_entry(category, &cache_key(key_parts))
    }

    async fn set(&self, category: &str, value: Value, key_parts: &[&str], ttl: Option<Duration>) {
        self.put_entry(category, &cache_key(key_parts), value, ttl);
    }

    async fn invalidate(&self, scope: Scope<'_>) {
        self.clear(scope);
    }

    async fn stats(&self, category: &str) -> CacheStats {
        self.category_stats(category)
    }
}
