use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Keys with a write in flight. A key also collides with any pending key that
/// is its parent or child path.
#[derive(Debug, Default, Clone)]
pub(crate) struct PendingKeys {
    inner: Arc<Mutex<HashSet<String>>>,
}

pub(crate) struct PendingGuard {
    keys: PendingKeys,
    key: String,
}

impl PendingKeys {
    pub(crate) fn try_acquire(&self, key: &str) -> Option<PendingGuard> {
        let mut pending = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let collides = pending.iter().any(|p| {
            p == key || is_parent(p, key) || is_parent(key, p)
        });
        if collides {
            tracing::debug!(key, "store key is pending, skip it");
            return None;
        }
        pending.insert(key.to_string());
        Some(PendingGuard {
            keys: self.clone(),
            key: key.to_string(),
        })
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self.keys.inner.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&self.key);
    }
}

fn is_parent(parent: &str, child: &str) -> bool {
    child.len() > parent.len()
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'/'
}
