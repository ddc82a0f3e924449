// Local disk blob store
//
// One JSON file per entry under `<root>/<category>/<sha256(key)>.json`.
// Last-resort cache layer; survives restarts but is not shared across hosts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{expiry_from_now, is_expired, SharedStore, StoredEntry};
use crate::error::AppError;

#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    key: String,
    value: String,
    /// Epoch milliseconds
    expires_at: i64,
}

pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Create the root directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, AppError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| {
                AppError::CacheUnavailable(format!("cannot create {}: {}", root.display(), e))
            })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn category_dir(&self, category: &str) -> PathBuf {
        // category names are internal, but keep them path-safe regardless
        let safe: String = category
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.root.join(safe)
    }

    fn entry_path(&self, category: &str, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.category_dir(category).join(format!("{}.json", name))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> AppError {
    AppError::CacheUnavailable(format!("{}: {}", path.display(), err))
}

async fn count_files(dir: &Path) -> Result<u64, AppError> {
    let mut count = 0;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error(dir, e)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
        if entry.path().extension().is_some_and(|ext| ext == "json") {
            count += 1;
        }
    }
    Ok(count)
}

#[async_trait::async_trait]
impl SharedStore for DiskStore {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn get(&self, category: &str, key: &str) -> Result<Option<StoredEntry>, AppError> {
        let path = self.entry_path(category, key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };

        let entry: DiskEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Discarding unreadable cache file {}: {}", path.display(), e);
                let _ = tokio::fs::remove_file(&path).await;
                return Ok(None);
            }
        };

        if entry.key != key || is_expired(entry.expires_at) {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }

        Ok(Some(StoredEntry {
            value: entry.value,
            expires_at: entry.expires_at,
        }))
    }

    async fn set(
        &self,
        category: &str,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let dir = self.category_dir(category);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| io_error(&dir, e))?;

        let entry = DiskEntry {
            key: key.to_string(),
            value: value.to_string(),
            expires_at: expiry_from_now(ttl),
        };
        let path = self.entry_path(category, key);
        let tmp = path.with_extension("json.tmp");

        // readers never see a partial file
        tokio::fs::write(&tmp, serde_json::to_vec(&entry)?)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    async fn invalidate(&self, category: Option<&str>) -> Result<u64, AppError> {
        let dirs: Vec<PathBuf> = match category {
            Some(category) => vec![self.category_dir(category)],
            None => {
                let mut dirs = Vec::new();
                let mut entries = tokio::fs::read_dir(&self.root)
                    .await
                    .map_err(|e| io_error(&self.root, e))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| io_error(&self.root, e))?
                {
                    if entry.path().is_dir() {
                        dirs.push(entry.path());
                    }
                }
                dirs
            }
        };

        let mut removed = 0;
        for dir in dirs {
            removed += count_files(&dir).await?;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&dir, e)),
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), AppError> {
        let metadata = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;
        if metadata.permissions().readonly() {
            return Err(AppError::CacheUnavailable(format!(
                "{} is read-only",
                self.root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_round_trip_on_disk() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("blobs")).await.unwrap();
        assert!(store.ping().await.is_ok());

        store
            .set("query_plan", "plan:abc", r#"{"base_table":"funds"}"#, Duration::from_secs(60))
            .await
            .unwrap();
        let entry = store.get("query_plan", "plan:abc").await.unwrap().unwrap();
        assert_eq!(entry.value, r#"{"base_table":"funds"}"#);
        assert!(entry.remaining().unwrap() <= Duration::from_secs(60));
        assert!(store.get("query_plan", "plan:other").await.unwrap().is_none());
        assert!(dir.path().join("blobs").join("query_plan").is_dir());
    }

    #[tokio::test]
    async fn test_expired_file_removed() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path()).await.unwrap();
        store.set("query_result", "k", "v", Duration::ZERO).await.unwrap();
        assert!(store.get("query_result", "k").await.unwrap().is_none());
        assert_eq!(count_files(&dir.path().join("query_result")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path()).await.unwrap();
        let ttl = Duration::from_secs(60);
        store.set("a", "1", "x", ttl).await.unwrap();
        store.set("a", "2", "x", ttl).await.unwrap();
        store.set("b", "1", "x", ttl).await.unwrap();

        assert_eq!(store.invalidate(Some("a")).await.unwrap(), 2);
        assert!(store.get("a", "1").await.unwrap().is_none());
        assert!(store.get("b", "1").await.unwrap().is_some());
        assert_eq!(store.invalidate(None).await.unwrap(), 1);
        assert_eq!(store.invalidate(Some("missing")).await.unwrap(), 0);
    }
}
