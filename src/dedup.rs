use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt as _;

use crate::config::DedupMode;
use crate::error::DedupError;

/// Durable set of digests that have already produced output.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn exists(&self, digest: &str) -> Result<bool, DedupError>;

    /// Records `digest`. Atomic per digest: exactly one concurrent caller
    /// succeeds, every other one gets [`DedupError::Duplicate`].
    async fn insert(&self, digest: &str) -> Result<String, DedupError>;
}

/// Opens a store from a connection string: `memory:` or `file:<dir>`.
pub fn open_store(url: &str) -> Result<Arc<dyn DedupStore>, DedupError> {
    let url = url.trim();
    if url == "memory:" || url == "memory" {
        return Ok(Arc::new(MemoryDedupStore::default()));
    }
    if let Some(dir) = url.strip_prefix("file://").or_else(|| url.strip_prefix("file:")) {
        if dir.is_empty() {
            return Err(DedupError::UnsupportedStore(url.to_owned()));
        }
        return Ok(Arc::new(LocalFsDedupStore::open(dir)?));
    }
    Err(DedupError::UnsupportedStore(url.to_owned()))
}

#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    digests: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn exists(&self, digest: &str) -> Result<bool, DedupError> {
        let digests = self.digests.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(digests.contains(digest))
    }

    async fn insert(&self, digest: &str) -> Result<String, DedupError> {
        let mut digests = self.digests.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !digests.insert(digest.to_owned()) {
            return Err(DedupError::Duplicate(digest.to_owned()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("mem-{id}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupRecord {
    pub id: String,
    pub digest: String,
    pub inserted_at: DateTime<Utc>,
}

/// One marker file per digest under `root/<first two chars>/<digest>`.
/// Creation uses `create_new`, so the filesystem arbitrates concurrent
/// inserts of the same digest, across threads and processes.
#[derive(Debug, Clone)]
pub struct LocalFsDedupStore {
    root: PathBuf,
}

impl LocalFsDedupStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DedupError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| DedupError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    fn marker_path(&self, digest: &str) -> Result<PathBuf, DedupError> {
        let valid = !digest.is_empty()
            && digest
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | ':' | '='));
        if !valid {
            return Err(DedupError::InvalidDigest(digest.to_owned()));
        }
        let shard: String = digest.chars().take(2).collect();
        Ok(self.root.join(shard).join(digest))
    }
}

#[async_trait]
impl DedupStore for LocalFsDedupStore {
    async fn exists(&self, digest: &str) -> Result<bool, DedupError> {
        let path = self.marker_path(digest)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| DedupError::Io { path, source })
    }

    async fn insert(&self, digest: &str) -> Result<String, DedupError> {
        let path = self.marker_path(digest)?;
        let io_err = |source| DedupError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(DedupError::Duplicate(digest.to_owned()));
            }
            Err(err) => return Err(io_err(err)),
        };

        let record = DedupRecord {
            id: uuid::Uuid::new_v4().simple().to_string(),
            digest: digest.to_owned(),
            inserted_at: Utc::now(),
        };
        let data = serde_json::to_vec(&record)?;
        file.write_all(&data).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(record.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The digest is new; in claim mode it is already recorded.
    Admitted,
    Duplicate,
}

/// Check/record contract around a [`DedupStore`], in either ordering.
#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn DedupStore>,
    mode: DedupMode,
}

impl DedupGate {
    pub fn new(store: Arc<dyn DedupStore>, mode: DedupMode) -> Self {
        Self { store, mode }
    }

    /// Decides whether output may be written for `digest`. In claim mode
    /// this is the atomic insert; in check-then-insert mode it only looks.
    pub async fn admit(&self, digest: &str) -> Result<(Admission, Option<String>), DedupError> {
        match self.mode {
            DedupMode::Claim => match self.store.insert(digest).await {
                Ok(id) => Ok((Admission::Admitted, Some(id))),
                Err(DedupError::Duplicate(_)) => Ok((Admission::Duplicate, None)),
                Err(err) => Err(err),
            },
            DedupMode::CheckThenInsert => {
                if self.store.exists(digest).await? {
                    Ok((Admission::Duplicate, None))
                } else {
                    Ok((Admission::Admitted, None))
                }
            }
        }
    }

    /// Records `digest` after its output was written. A no-op in claim mode.
    pub async fn commit(&self, digest: &str) -> Result<Option<String>, DedupError> {
        match self.mode {
            DedupMode::Claim => Ok(None),
            DedupMode::CheckThenInsert => match self.store.insert(digest).await {
                Ok(id) => Ok(Some(id)),
                Err(DedupError::Duplicate(_)) => {
                    tracing::warn!(digest, "digest was recorded concurrently after its check");
                    Ok(None)
                }
                Err(err) => Err(err),
            },
        }
    }
}
