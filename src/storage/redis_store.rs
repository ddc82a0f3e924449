// Redis cache store
//
// Network key/value layer shared by every process that points at the same
// server. Keys are `sqlgen:<category>:<key>`; expiry is left to Redis (PX).

use std::time::Duration;

use redis::aio::ConnectionManager;

use super::{now_millis, SharedStore, StoredEntry};
use crate::error::AppError;

const KEY_PREFIX: &str = "sqlgen";
const SCAN_BATCH: usize = 500;

pub struct RedisSharedStore {
    conn: ConnectionManager,
}

impl RedisSharedStore {
    /// Connect to `redis://[user:password@]host:port[/db]`.
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

fn entry_key(category: &str, key: &str) -> String {
    format!("{}:{}:{}", KEY_PREFIX, category, key)
}

fn category_pattern(category: Option<&str>) -> String {
    match category {
        Some(category) => format!("{}:{}:*", KEY_PREFIX, category),
        None => format!("{}:*", KEY_PREFIX),
    }
}

/// `PTTL` reply to an absolute expiry; -1 means the key never expires.
fn expiry_from_pttl(pttl: i64) -> Option<i64> {
    match pttl {
        -1 => Some(i64::MAX),
        ms if ms > 0 => Some(now_millis().saturating_add(ms)),
        _ => None,
    }
}

#[async_trait::async_trait]
impl SharedStore for RedisSharedStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, category: &str, key: &str) -> Result<Option<StoredEntry>, AppError> {
        let entry_key = entry_key(category, key);
        let mut conn = self.conn.clone();
        let (value, pttl): (Option<String>, i64) = redis::pipe()
            .cmd("GET")
            .arg(&entry_key)
            .cmd("PTTL")
            .arg(&entry_key)
            .query_async(&mut conn)
            .await?;

        Ok(value.and_then(|value| {
            expiry_from_pttl(pttl).map(|expires_at| StoredEntry { value, expires_at })
        }))
    }

    async fn set(
        &self,
        category: &str,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), AppError> {
        // PX rejects 0
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(entry_key(category, key))
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn invalidate(&self, category: Option<&str>) -> Result<u64, AppError> {
        let pattern = category_pattern(category);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }

    async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(entry_key("query_plan", "ab12"), "sqlgen:query_plan:ab12");
        assert_eq!(category_pattern(Some("query_plan")), "sqlgen:query_plan:*");
        assert_eq!(category_pattern(None), "sqlgen:*");
    }

    #[test]
    fn test_expiry_from_pttl() {
        let expires_at = expiry_from_pttl(5_000).unwrap();
        assert!(expires_at > now_millis() + 4_000);
        assert_eq!(expiry_from_pttl(-1), Some(i64::MAX));
        assert_eq!(expiry_from_pttl(-2), None);
        assert_eq!(expiry_from_pttl(0), None);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            RedisSharedStore::connect("redis://127.0.0.1:1/"),
        )
        .await;
        // either refused outright or still retrying when the timeout fires
        assert!(!matches!(result, Ok(Ok(_))));
    }
}
