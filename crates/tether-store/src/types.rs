use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("specified key is empty")]
    Empty,
    #[error("specified key is not found")]
    NotFound,
    #[error("specified key has no contents")]
    NoContent,
    #[error("specified key is under accessing")]
    Conflict,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Durable key/value backend for cached list payloads.
///
/// Keys are slash separated relative paths (`cache/pods/default/consistency`).
/// A `put` with empty contents creates the key without data; a later `get`
/// on it fails with `NoContent`. A `put` racing another write to the same key
/// (or to a parent/child path of it) fails with `Conflict`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;
}

pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::Empty);
    }
    let valid = !key.starts_with('/')
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if !valid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
