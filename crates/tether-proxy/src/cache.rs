use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tether_common::{ListCodecError, ObjectList, ResourceKind, UnsupportedResource};
use tether_store::{Store, StoreError};
use tokio::sync::Mutex;

use crate::classify::{PolicyClass, RequestInfo};

/// Label key whose value selects which items a durable entry keeps.
const TYPE_LABEL: &str = "type";
/// Namespace segment for cluster-wide lists. Not a valid namespace name.
const CLUSTER_SCOPE: &str = "_cluster";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    UnsupportedResource(#[from] UnsupportedResource),
    #[error(transparent)]
    Codec(#[from] ListCodecError),
    #[error("failed to read response body: {0}")]
    Read(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CacheError {
    /// Nothing has been cached under the key yet.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CacheError::Store(StoreError::NotFound | StoreError::NoContent)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryClass {
    /// List without a selector; every item is kept.
    Default,
    Consistency,
    ResourceUsage,
}

impl QueryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryClass::Default => "default",
            QueryClass::Consistency => "consistency",
            QueryClass::ResourceUsage => "resourceusage",
        }
    }

    pub fn for_policy(policy: PolicyClass) -> Option<Self> {
        match policy {
            PolicyClass::Unselected => Some(QueryClass::Default),
            PolicyClass::Durable => Some(QueryClass::Consistency),
            PolicyClass::Volatile => Some(QueryClass::ResourceUsage),
            _ => None,
        }
    }

    fn retained_type(&self) -> Option<&'static str> {
        match self {
            QueryClass::Default => None,
            other => Some(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub query_class: QueryClass,
}

impl CacheKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, query_class: QueryClass) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            query_class,
        }
    }

    pub fn parse(
        resource: &str,
        namespace: impl Into<String>,
        query_class: QueryClass,
    ) -> Result<Self, CacheError> {
        Ok(Self::new(resource.parse()?, namespace, query_class))
    }

    /// Key for a cacheable request: a list of a supported kind whose policy
    /// maps to a query class.
    pub fn for_request(info: &RequestInfo) -> Option<Self> {
        let kind = info.supported_list()?;
        let query_class = QueryClass::for_policy(info.policy)?;
        Some(Self::new(kind, info.namespace.clone(), query_class))
    }

    /// Path of the entry in the durable store, `cache/<resource>/<ns>/<class>`.
    pub fn storage_key(&self) -> String {
        let namespace = if self.namespace.is_empty() {
            CLUSTER_SCOPE
        } else {
            self.namespace.as_str()
        };
        format!("cache/{}/{}/{}", self.kind, namespace, self.query_class.as_str())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Stored { items: usize },
    AlreadyCached,
}

/// Two cache tiers over list payloads.
///
/// The durable tier goes through a [`Store`] and only keeps items labelled
/// with the key's query class. The volatile tier lives in process memory and
/// keeps payloads byte for byte. Both are first-write-wins: once a key holds
/// an entry, later payloads for it are ignored.
pub struct CacheManager {
    store: Arc<dyn Store>,
    volatile: DashMap<CacheKey, Bytes>,
    durable_populated: DashMap<CacheKey, ()>,
    gates: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            volatile: DashMap::new(),
            durable_populated: DashMap::new(),
            gates: DashMap::new(),
        }
    }

    pub async fn cache_list(&self, key: &CacheKey, raw: &[u8]) -> Result<CacheOutcome, CacheError> {
        if self.is_durable_populated(key) {
            return Ok(CacheOutcome::AlreadyCached);
        }
        let storage_key = key.storage_key();
        match self.store.get(&storage_key).await {
            Ok(_) => {
                self.durable_populated.insert(key.clone(), ());
                return Ok(CacheOutcome::AlreadyCached);
            }
            Err(StoreError::NotFound | StoreError::NoContent) => {}
            Err(e) => return Err(e.into()),
        }

        let mut list = ObjectList::decode(key.kind, raw)?;
        if let Some(wanted) = key.query_class.retained_type() {
            list.items.retain(|item| item.label(TYPE_LABEL) == Some(wanted));
        }
        let items = list.items.len();
        let encoded = Bytes::from(list.encode(key.kind)?);

        self.store.put(&storage_key, encoded).await?;
        self.durable_populated.insert(key.clone(), ());
        tracing::info!(key=%storage_key, items, "durable cache populated");
        Ok(CacheOutcome::Stored { items })
    }

    /// Returns false when the key already had an entry.
    pub fn cache_list_volatile(&self, key: &CacheKey, raw: Bytes) -> bool {
        let mut inserted = false;
        self.volatile.entry(key.clone()).or_insert_with(|| {
            inserted = true;
            raw
        });
        // holders of the gate keep their Arc; later callers see the entry
        self.gates.remove(key);
        inserted
    }

    pub async fn query_durable(&self, key: &CacheKey) -> Result<Bytes, CacheError> {
        Ok(self.store.get(&key.storage_key()).await?)
    }

    pub fn query_volatile(&self, key: &CacheKey) -> Option<Bytes> {
        self.volatile.get(key).map(|entry| entry.value().clone())
    }

    pub fn is_durable_populated(&self, key: &CacheKey) -> bool {
        self.durable_populated.contains_key(key)
    }

    /// Lock serializing volatile population of `key`, or `None` once the
    /// key is populated. A gate is dropped from the map as soon as its key
    /// holds an entry, so the map only tracks keys still being populated.
    pub fn population_gate(&self, key: &CacheKey) -> Option<Arc<Mutex<()>>> {
        let gate = self.gates.entry(key.clone());
        if self.volatile.contains_key(key) {
            return None;
        }
        Some(Arc::clone(gate.or_default().value()))
    }

    #[cfg(test)]
    pub(crate) fn open_gates(&self) -> usize {
        self.gates.len()
    }
}
