//! Durable record storage
//!
//! A small key-value seam over the filesystem. Writes are atomic: the
//! payload lands in a temp file, is fsynced, then renamed over the final
//! path, so a crash can never leave a half-written record behind.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Storage failures surfaced to callers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid record key: {0}")]
    InvalidKey(String),

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Atomic single-record storage.
///
/// Keys are slash-separated paths of plain segments. A `put` that returns
/// `Ok` guarantees the record survives immediate process death.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, payload: &[u8]) -> Result<(), StoreError>;

    /// Returns whether the record existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys under a prefix, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Filesystem-backed record store rooted at one directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let mut path = self.root.clone();
        for segment in key.split('/') {
            let valid = !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                && segment != "."
                && segment != "..";
            if !valid {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.key_path(key)?;
        match async_fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, payload: &[u8]) -> Result<(), StoreError> {
        let final_path = self.key_path(key)?;
        if let Some(parent) = final_path.parent() {
            async_fs::create_dir_all(parent).await?;
        }

        let temp_path = final_path.with_extension("tmp");
        let mut file = async_fs::File::create(&temp_path).await?;
        file.write_all(payload).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = async_fs::rename(&temp_path, &final_path).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        debug!(key, bytes = payload.len(), "record written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.key_path(key)?;
        match async_fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let root = self.key_path(prefix)?;
        let mut keys = Vec::new();
        let mut stack = vec![(root, prefix.to_string())];
        while let Some((dir, key_prefix)) = stack.pop() {
            let mut entries = match async_fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = format!("{key_prefix}/{name}");
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push((entry.path(), key));
                } else if !name.ends_with(".tmp") {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}
