pub mod disk;
pub mod redis_store;
pub mod sqlite;

pub use disk::DiskStore;
pub use redis_store::RedisSharedStore;
pub use sqlite::SqliteSharedStore;

use std::time::Duration;

use crate::error::AppError;

/// A stored payload and the moment it stops being valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: String,
    /// Milliseconds since the Unix epoch
    pub expires_at: i64,
}

impl StoredEntry {
    /// Lifetime left, or `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        let left = self.expires_at.saturating_sub(now_millis());
        u64::try_from(left)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Key/value backing store for the lower cache layers.
///
/// Entries are namespaced by category; values are opaque serialized payloads.
#[async_trait::async_trait]
pub trait SharedStore: Send + Sync {
    /// Layer name for logs.
    fn name(&self) -> &'static str;

    async fn get(&self, category: &str, key: &str) -> Result<Option<StoredEntry>, AppError>;

    async fn set(
        &self,
        category: &str,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), AppError>;

    /// Drop one category, or everything when `category` is `None`.
    /// Returns the number of entries removed.
    async fn invalidate(&self, category: Option<&str>) -> Result<u64, AppError>;

    /// Availability check run once at startup.
    async fn ping(&self) -> Result<(), AppError>;
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Epoch milliseconds at which an entry written now with `ttl` expires.
pub(crate) fn expiry_from_now(ttl: Duration) -> i64 {
    let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_add(ttl)
}

pub(crate) fn is_expired(expires_at: i64) -> bool {
    now_millis() >= expires_at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_lifetime() {
        let entry = StoredEntry {
            value: "v".to_string(),
            expires_at: expiry_from_now(Duration::from_secs(60)),
        };
        let left = entry.remaining().unwrap();
        assert!(left <= Duration::from_secs(60));
        assert!(left > Duration::from_secs(55));

        let expired = StoredEntry {
            value: "v".to_string(),
            expires_at: now_millis() - 1,
        };
        assert!(expired.remaining().is_none());
        assert!(is_expired(expired.expires_at));
    }
}
