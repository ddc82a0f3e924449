use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{expiry_from_now, is_expired, now_millis, SharedStore, StoredEntry};
use crate::error::AppError;

/// How long a writer waits on a lock held by another process
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// SQLite-backed cache store, shareable between processes on one host.
///
/// rusqlite is blocking, so every statement runs on the blocking pool and the
/// caller's timeout can abandon it.
pub struct SqliteSharedStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSharedStore {
    /// Open (or create) the store at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, AppError> {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path = match path_str.strip_prefix("sqlite:") {
            Some(rest) => rest.trim_start_matches("//").to_string(),
            None => path_str.to_string(),
        };

        let conn = tokio::task::spawn_blocking(move || Connection::open(clean_path))
            .await
            .map_err(join_error)??;
        Self::init(conn).await
    }

    /// In-memory store, mostly for tests
    pub async fn in_memory() -> Result<Self, AppError> {
        Self::init(Connection::open_in_memory()?).await
    }

    async fn init(conn: Connection) -> Result<Self, AppError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store
            .with_conn(|conn| {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS cache_entries (
                        category TEXT NOT NULL,
                        cache_key TEXT NOT NULL,
                        value TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        expires_at INTEGER NOT NULL,
                        PRIMARY KEY (category, cache_key)
                    );
                    CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at
                        ON cache_entries(expires_at);
                    "#,
                )?;
                Ok(())
            })
            .await?;

        Ok(store)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, AppError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .map_err(join_error)?
    }

    /// Delete every expired entry
    pub async fn purge_expired(&self) -> Result<usize, AppError> {
        let removed = self
            .with_conn(|conn| {
                Ok(conn.execute(
                    "DELETE FROM cache_entries WHERE expires_at <= ?1",
                    rusqlite::params![now_millis()],
                )?)
            })
            .await?;
        if removed > 0 {
            tracing::info!("Purged {} expired shared cache entries", removed);
        }
        Ok(removed)
    }
}

fn join_error(err: tokio::task::JoinError) -> AppError {
    AppError::CacheUnavailable(format!("sqlite task failed: {}", err))
}

#[async_trait::async_trait]
impl SharedStore for SqliteSharedStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, category: &str, key: &str) -> Result<Option<StoredEntry>, AppError> {
        let (category, key) = (category.to_string(), key.to_string());
        self.with_conn(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT value, expires_at FROM cache_entries \
                     WHERE category = ?1 AND cache_key = ?2",
                    rusqlite::params![category, key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((_, expires_at)) if is_expired(expires_at) => {
                    conn.execute(
                        "DELETE FROM cache_entries WHERE category = ?1 AND cache_key = ?2",
                        rusqlite::params![category, key],
                    )?;
                    Ok(None)
                }
                Some((value, expires_at)) => Ok(Some(StoredEntry { value, expires_at })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(
        &self,
        category: &str,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let params = (
            category.to_string(),
            key.to_string(),
            value.to_string(),
            chrono::Utc::now().to_rfc3339(),
            expiry_from_now(ttl),
        );
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO cache_entries
                    (category, cache_key, value, created_at, expires_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                rusqlite::params![params.0, params.1, params.2, params.3, params.4],
            )?;
            Ok(())
        })
        .await
    }

    async fn invalidate(&self, category: Option<&str>) -> Result<u64, AppError> {
        let category = category.map(str::to_string);
        self.with_conn(move |conn| {
            let removed = match category {
                Some(category) => conn.execute(
                    "DELETE FROM cache_entries WHERE category = ?1",
                    rusqlite::params![category],
                )?,
                None => conn.execute("DELETE FROM cache_entries", [])?,
            };
            Ok(removed as u64)
        })
        .await
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_store_creation_from_url() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("cache.db").display());
        let store = SqliteSharedStore::new(&url).await.unwrap();
        assert!(store.ping().await.is_ok());
        assert!(dir.path().join("cache.db").exists());
    }

    #[tokio::test]
    async fn test_set_get_and_overwrite() {
        let store = SqliteSharedStore::in_memory().await.unwrap();
        let ttl = Duration::from_secs(60);
        store.set("query_plan", "k1", "v1", ttl).await.unwrap();
        let entry = store.get("query_plan", "k1").await.unwrap().unwrap();
        assert_eq!(entry.value, "v1");
        assert!(entry.remaining().unwrap() <= ttl);

        store.set("query_plan", "k1", "v2", ttl).await.unwrap();
        let entry = store.get("query_plan", "k1").await.unwrap().unwrap();
        assert_eq!(entry.value, "v2");

        // categories are separate namespaces
        assert!(store.get("sql_validation", "k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses() {
        let store = SqliteSharedStore::in_memory().await.unwrap();
        store.set("query_result", "k", "v", Duration::ZERO).await.unwrap();
        assert!(store.get("query_result", "k").await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = SqliteSharedStore::in_memory().await.unwrap();
        store.set("query_result", "old", "v", Duration::ZERO).await.unwrap();
        store.set("query_result", "new", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get("query_result", "new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_two_handles_share_one_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let writer = SqliteSharedStore::new(&path).await.unwrap();
        let reader = SqliteSharedStore::new(&path).await.unwrap();

        writer.set("query_plan", "k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(reader.get("query_plan", "k").await.unwrap().unwrap().value, "v");
    }

    #[tokio::test]
    async fn test_invalidate_category_and_all() {
        let store = SqliteSharedStore::in_memory().await.unwrap();
        let ttl = Duration::from_secs(60);
        store.set("a", "1", "x", ttl).await.unwrap();
        store.set("a", "2", "x", ttl).await.unwrap();
        store.set("b", "1", "x", ttl).await.unwrap();

        assert_eq!(store.invalidate(Some("a")).await.unwrap(), 2);
        assert!(store.get("a", "1").await.unwrap().is_none());
        assert!(store.get("b", "1").await.unwrap().is_some());

        assert_eq!(store.invalidate(None).await.unwrap(), 1);
    }
}
