use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::pending::PendingKeys;
use crate::types::{validate_key, Store, StoreError};

/// Process-local `Store`. Contents are lost on restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<BTreeMap<String, Bytes>>>,
    pending: PendingKeys,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        validate_key(key)?;
        let _guard = self.pending.try_acquire(key).ok_or(StoreError::Conflict)?;
        let mut inner = self.inner.write().await;
        if value.is_empty() {
            if let Some(existing) = inner.get(key) {
                if !existing.is_empty() {
                    return Err(StoreError::NoContent);
                }
            }
        }
        inner.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        validate_key(key)?;
        let inner = self.inner.read().await;
        match inner.get(key) {
            None => Err(StoreError::NotFound),
            Some(v) if v.is_empty() => Err(StoreError::NoContent),
            Some(v) => Ok(v.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let store = MemoryStore::new();
        store
            .put("cache/pods/default/consistency", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let got = store.get("cache/pods/default/consistency").await.unwrap();
        assert_eq!(got, Bytes::from_static(b"{}"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn missing_and_empty_keys() {
        let store = MemoryStore::new();
        assert!(matches!(store.get("a/b").await, Err(StoreError::NotFound)));
        assert!(matches!(store.get("").await, Err(StoreError::Empty)));

        store.put("a/b", Bytes::new()).await.unwrap();
        assert!(matches!(store.get("a/b").await, Err(StoreError::NoContent)));
    }

    #[tokio::test]
    async fn concurrent_put_on_same_key_conflicts() {
        let store = MemoryStore::new();
        let _held = store.pending.try_acquire("a/b").unwrap();
        let err = store.put("a/b", Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }
}
