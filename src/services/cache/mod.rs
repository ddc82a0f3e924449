//! Layered cache: in-process LRU → shared store → local disk.
//!
//! Components receive the cache as an injected [`CacheService`] so tests can
//! substitute a bare [`MemoryCache`].

mod manager;
mod memory;

pub use manager::CacheManager;
pub use memory::MemoryCache;

use std::collections::HashMap;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const ENTITY_RESOLUTION: &str = "entity_resolution";
pub const QUERY_PLAN: &str = "query_plan";
pub const SQL_VALIDATION: &str = "sql_validation";
pub const QUERY_RESULT: &str = "query_result";

pub const DEFAULT_TTL_SECS: u64 = 600;
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Per-category TTL defaults in seconds.
pub fn default_ttls() -> HashMap<String, u64> {
    HashMap::from([
        (ENTITY_RESOLUTION.to_string(), 86_400),
        (QUERY_PLAN.to_string(), 3_600),
        (SQL_VALIDATION.to_string(), 1_800),
        (QUERY_RESULT.to_string(), 300),
    ])
}

/// Stable lookup key derived from the call's arguments.
///
/// Parts are length-prefixed before hashing so `["ab", "c"]` and `["a", "bc"]`
/// never collide.
pub fn cache_key(key_parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in key_parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Invalidation scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    Category(&'a str),
    All,
}

impl<'a> Scope<'a> {
    pub fn category(&self) -> Option<&'a str> {
        match *self {
            Scope::Category(c) => Some(c),
            Scope::All => None,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Hit ratio (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Narrow cache capability injected into pipeline components.
#[async_trait::async_trait]
pub trait CacheService: Send + Sync {
    async fn get(&self, category: &str, key_parts: &[&str]) -> Option<Value>;

    /// `ttl = None` uses the category default.
    async fn set(&self, category: &str, value: Value, key_parts: &[&str], ttl: Option<Duration>);

    async fn invalidate(&self, scope: Scope<'_>);

    async fn stats(&self, category: &str) -> CacheStats;
}

/// Typed get; undecodable payloads count as misses.
pub async fn get_typed<T: DeserializeOwned>(
    cache: &dyn CacheService,
    category: &str,
    key_parts: &[&str],
) -> Option<T> {
    let value = cache.get(category, key_parts).await?;
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Ignoring undecodable {} cache entry: {}", category, e);
            None
        }
    }
}

/// Typed set; unserializable values are logged and skipped.
pub async fn set_typed<T: Serialize>(
    cache: &dyn CacheService,
    category: &str,
    value: &T,
    key_parts: &[&str],
) {
    match serde_json::to_value(value) {
        Ok(v) => cache.set(category, v, key_parts, None).await,
        Err(e) => tracing::warn!("Not caching {} entry: {}", category, e),
    }
}
