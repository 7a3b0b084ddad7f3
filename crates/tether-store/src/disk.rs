use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::pending::PendingKeys;
use crate::types::{validate_key, Store, StoreError};

const TMP_PREFIX: &str = "tmp_";

/// `Store` keeping one file per key below `base_dir`.
///
/// Writes go to `tmp_<name>` next to the target, are fsynced, then renamed
/// over it, so a reader sees either the old or the new contents. A leftover
/// `tmp_` file can only come from a write that never reached its rename and
/// is removed by [`DiskStore::recover`].
#[derive(Debug, Clone)]
pub struct DiskStore {
    base_dir: PathBuf,
    pending: PendingKeys,
}

impl DiskStore {
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        if base_dir.as_os_str().is_empty() {
            return Err(StoreError::InvalidKey("empty base dir".to_string()));
        }
        tokio::fs::create_dir_all(&base_dir).await?;

        let store = Self {
            base_dir,
            pending: PendingKeys::default(),
        };
        match store.recover().await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "discarded unfinished cache writes"),
            Err(e) => tracing::warn!(error=%e, "failed to recover local storage, skipping"),
        }
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Delete every uncommitted `tmp_` file under the base directory.
    /// Returns how many were removed.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        let mut dirs = vec![self.base_dir.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    dirs.push(entry.path());
                } else if file_type.is_file() && is_tmp_file(&entry.path()) {
                    tokio::fs::remove_file(entry.path()).await?;
                    tracing::debug!(path=%entry.path().display(), "removed unfinished write");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    async fn create_dir_only(&self, path: &Path) -> Result<(), StoreError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StoreError::NoContent),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio::fs::create_dir_all(path).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), StoreError> {
        let (dir, file_name) = match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) => (dir, name.to_string_lossy().to_string()),
            _ => return Err(StoreError::InvalidKey(path.display().to_string())),
        };
        tokio::fs::create_dir_all(dir).await?;

        let tmp_path = dir.join(format!("{TMP_PREFIX}{file_name}"));
        let mut f = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        let written = async {
            f.write_all(contents).await?;
            f.sync_all().await
        }
        .await;
        drop(f);

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        validate_key(key)?;
        let _guard = self.pending.try_acquire(key).ok_or(StoreError::Conflict)?;
        let path = self.key_path(key);
        if value.is_empty() {
            return self.create_dir_only(&path).await;
        }
        self.write_atomic(&path, &value).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        validate_key(key)?;
        let path = self.key_path(key);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            return Err(StoreError::NoContent);
        }
        if !meta.is_file() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(Bytes::from(tokio::fs::read(&path).await?))
    }
}

fn is_tmp_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with(TMP_PREFIX))
        .unwrap_or(false)
}
