//! Content Cache
//!
//! Content-addressable memoization of orchestration results, keyed by
//! [`crate::hasher::cache_key`]. Entries never expire; `put` overwrites.
//! There is no locking across `get`/`put`: two concurrent misses for the same
//! key both compute and the last write wins.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::orchestrator::OrchestrationResult;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid cache key: {0}")]
    InvalidKey(String),
}

#[async_trait]
pub trait ContentCache: Send + Sync {
    /// `None` on a miss. Unreadable entries are treated as misses.
    async fn get(&self, key: &str) -> Result<Option<OrchestrationResult>, CacheError>;
    async fn put(&self, key: &str, value: &OrchestrationResult) -> Result<(), CacheError>;
}

/// One JSON file per key under `base_path`.
pub struct FsContentCache {
    base_path: PathBuf,
}

impl FsContentCache {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn path_for_key(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl ContentCache for FsContentCache {
    async fn get(&self, key: &str) -> Result<Option<OrchestrationResult>, CacheError> {
        let path = self.path_for_key(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&bytes) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable cache entry");
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, value: &OrchestrationResult) -> Result<(), CacheError> {
        let path = self.path_for_key(key)?;
        tokio::fs::create_dir_all(&self.base_path).await?;

        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serde_json::to_vec(value)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// In-process cache.
#[derive(Default)]
pub struct MemoryContentCache {
    entries: RwLock<HashMap<String, OrchestrationResult>>,
}

impl MemoryContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ContentCache for MemoryContentCache {
    async fn get(&self, key: &str) -> Result<Option<OrchestrationResult>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &OrchestrationResult) -> Result<(), CacheError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.clone());
        Ok(())
    }
}
