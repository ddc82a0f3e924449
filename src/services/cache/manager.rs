// Cache Manager
//
// Checks the in-process layer, then the shared store, then the disk store.
// A hit in a lower layer is copied into every layer above it. Lower layers
// are optional and every call to them is bounded by a timeout; any failure
// there is logged and treated as a miss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;

use super::{cache_key, default_ttls, CacheService, CacheStats, MemoryCache, Scope};
use crate::config::CacheConfig;
use crate::error::AppError;
use crate::services::connection_pool::mask_credentials;
use crate::storage::{DiskStore, RedisSharedStore, SharedStore, SqliteSharedStore};

pub struct CacheManager {
    memory: MemoryCache,
    /// Lower layers in lookup order
    layers: Vec<Arc<dyn SharedStore>>,
    ttls: HashMap<String, Duration>,
    default_ttl: Duration,
    layer_timeout: Duration,
    stats: Mutex<HashMap<String, CacheStats>>,
}

impl CacheManager {
    pub fn new(
        memory: MemoryCache,
        layers: Vec<Arc<dyn SharedStore>>,
        config: &CacheConfig,
    ) -> Self {
        let mut ttls = default_ttls();
        ttls.extend(config.ttl.clone());

        Self {
            memory: memory.with_ttls(&ttls),
            layers,
            ttls: ttls
                .into_iter()
                .map(|(category, secs)| (category, Duration::from_secs(secs)))
                .collect(),
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            layer_timeout: Duration::from_millis(config.layer_timeout_ms),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// In-process only
    pub fn memory_only(config: &CacheConfig) -> Self {
        Self::new(
            MemoryCache::new(config.max_entries_per_category, config.default_ttl_secs),
            Vec::new(),
            config,
        )
    }

    /// Build from configuration, skipping (and logging) any layer that is
    /// unreachable at startup.
    pub async fn from_config(config: &CacheConfig) -> Self {
        let mut layers: Vec<Arc<dyn SharedStore>> = Vec::new();

        if let Some(url) = &config.shared_store_url {
            match open_shared_store(url).await {
                Ok(store) => layers.push(store),
                Err(e) => {
                    tracing::warn!("Shared cache store unavailable, continuing without it: {}", e)
                }
            }
        }

        if let Some(dir) = &config.disk_dir {
            match DiskStore::new(dir).await {
                Ok(store) => {
                    tracing::debug!("Disk cache rooted at {}", store.root().display());
                    layers.push(Arc::new(store));
                }
                Err(e) => tracing::warn!("Disk cache unavailable, continuing without it: {}", e),
            }
        }

        Self::new(
            MemoryCache::new(config.max_entries_per_category, config.default_ttl_secs),
            layers,
            config,
        )
        .check_layers()
        .await
    }

    /// Ping every lower layer and drop the ones that do not answer.
    async fn check_layers(mut self) -> Self {
        let mut healthy = Vec::with_capacity(self.layers.len());
        for layer in std::mem::take(&mut self.layers) {
            match self.bounded(layer.name(), layer.ping()).await {
                Ok(()) => healthy.push(layer),
                Err(e) => tracing::warn!(
                    "Cache layer '{}' failed startup ping, skipping: {}",
                    layer.name(),
                    e
                ),
            }
        }
        self.layers = healthy;

        tracing::info!("Cache layers: {}", self.layer_names().join(" -> "));
        self
    }

    /// Names of the active layers, fastest first.
    pub fn layer_names(&self) -> Vec<&'static str> {
        std::iter::once("memory")
            .chain(self.layers.iter().map(|l| l.name()))
            .collect()
    }

    pub fn ttl_for(&self, category: &str) -> Duration {
        self.ttls.get(category).copied().unwrap_or(self.default_ttl)
    }

    async fn bounded<T>(
        &self,
        layer: &str,
        fut: impl std::future::Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        match tokio::time::timeout(self.layer_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::CacheUnavailable(format!(
                "{} layer timed out after {:?}",
                layer, self.layer_timeout
            ))),
        }
    }

    fn record(&self, category: &str, update: impl FnOnce(&mut CacheStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        update(stats.entry(category.to_string()).or_default());
    }
}

/// Connect timeout for a network shared store
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// `redis://` and `rediss://` select the network store; anything else is a
/// SQLite path or `sqlite:` URL.
async fn open_shared_store(url: &str) -> Result<Arc<dyn SharedStore>, AppError> {
    if is_redis_url(url) {
        let store = tokio::time::timeout(CONNECT_TIMEOUT, RedisSharedStore::connect(url))
            .await
            .map_err(|_| {
                AppError::CacheUnavailable(format!("connect timed out after {:?}", CONNECT_TIMEOUT))
            })??;
        tracing::info!("Shared cache store: redis at {}", mask_credentials(url));
        return Ok(Arc::new(store));
    }

    let store = SqliteSharedStore::new(url).await?;
    if let Err(e) = store.purge_expired().await {
        tracing::warn!("Failed to purge expired shared cache entries: {}", e);
    }
    Ok(Arc::new(store))
}

fn is_redis_url(url: &str) -> bool {
    url.starts_with("redis://") || url.starts_with("rediss://")
}

#[async_trait::async_trait]
impl CacheService for CacheManager {
    async fn get(&self, category: &str, key_parts: &[&str]) -> Option<Value> {
        let key = cache_key(key_parts);

        if let Some(value) = self.memory.get_entry(category, &key) {
            tracing::debug!("Cache hit (memory): {}/{}", category, key);
            self.record(category, |s| s.hits += 1);
            return Some(value);
        }

        for (depth, layer) in self.layers.iter().enumerate() {
            let entry = match self.bounded(layer.name(), layer.get(category, &key)).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Cache layer '{}' unavailable on get: {}", layer.name(), e);
                    continue;
                }
            };
            // expired between the layer's check and now
            let Some(remaining) = entry.remaining() else {
                continue;
            };

            let value: Value = match serde_json::from_str(&entry.value) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Corrupt entry in cache layer '{}': {}", layer.name(), e);
                    continue;
                }
            };

            tracing::debug!("Cache hit ({}): {}/{}", layer.name(), category, key);

            // populate faster layers with the lifetime the entry has left
            for upper in &self.layers[..depth] {
                let write = upper.set(category, &key, &entry.value, remaining);
                if let Err(e) = self.bounded(upper.name(), write).await {
                    tracing::warn!("Cache layer '{}' unavailable on backfill: {}", upper.name(), e);
                }
            }
            if self
                .memory
                .put_entry(category, &key, value.clone(), Some(remaining))
                .is_some()
            {
                self.record(category, |s| s.evictions += 1);
            }

            self.record(category, |s| s.hits += 1);
            return Some(value);
        }

        tracing::debug!("Cache miss: {}/{}", category, key);
        self.record(category, |s| s.misses += 1);
        None
    }

    async fn set(&self, category: &str, value: Value, key_parts: &[&str], ttl: Option<Duration>) {
        let key = cache_key(key_parts);
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(category));

        if !self.layers.is_empty() {
            match serde_json::to_string(&value) {
                Ok(raw) => {
                    for layer in &self.layers {
                        let write = layer.set(category, &key, &raw, ttl);
                        if let Err(e) = self.bounded(layer.name(), write).await {
                            let name = layer.name();
                            tracing::warn!("Cache layer '{}' unavailable on set: {}", name, e);
                        }
                    }
                }
                Err(e) => tracing::warn!("Cannot serialize {} cache entry: {}", category, e),
            }
        }

        if self.memory.put_entry(category, &key, value, Some(ttl)).is_some() {
            self.record(category, |s| s.evictions += 1);
        }
        self.record(category, |s| s.sets += 1);
    }

    async fn invalidate(&self, scope: Scope<'_>) {
        self.memory.clear(scope);
        for layer in &self.layers {
            match self.bounded(layer.name(), layer.invalidate(scope.category())).await {
                Ok(removed) => tracing::info!(
                    "Invalidated {} entries in cache layer '{}'",
                    removed,
                    layer.name()
                ),
                Err(e) => tracing::warn!(
                    "Cache layer '{}' unavailable on invalidate: {}",
                    layer.name(),
                    e
                ),
            }
        }
    }

    async fn stats(&self, category: &str) -> CacheStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(category)
            .cloned()
            .unwrap_or_default();
        stats.expirations = self.memory.category_stats(category).expirations;
        stats
    }
}
