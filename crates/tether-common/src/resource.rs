use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Resource kinds whose list responses the proxy knows how to decode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pods,
    ConfigMaps,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported resource type: {0}")]
pub struct UnsupportedResource(pub String);

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pods => "pods",
            ResourceKind::ConfigMaps => "configmaps",
        }
    }

    /// The `kind` literal carried by a list response of this resource.
    pub fn list_kind(&self) -> &'static str {
        match self {
            ResourceKind::Pods => "PodList",
            ResourceKind::ConfigMaps => "ConfigMapList",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = UnsupportedResource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pods" => Ok(ResourceKind::Pods),
            "configmaps" => Ok(ResourceKind::ConfigMaps),
            other => Err(UnsupportedResource(other.to_string())),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A list envelope. Only `items[].metadata` is interpreted; every other field
/// is kept in `rest` so a decode/encode cycle does not lose data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObjectList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub items: Vec<Object>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Object {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "null_as_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Object {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(|s| s.as_str())
    }
}

/// Failure to turn a payload into an `ObjectList` of an expected kind, or back.
#[derive(Debug, thiserror::Error)]
pub enum ListCodecError {
    #[error("failed to decode {kind} list: {source}")]
    Decode {
        kind: ResourceKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("decoded object is {found}, expected {expected}")]
    UnexpectedKind {
        expected: &'static str,
        found: String,
    },
    #[error("failed to encode {kind} list: {source}")]
    Encode {
        kind: ResourceKind,
        #[source]
        source: serde_json::Error,
    },
}

impl ObjectList {
    /// Decode `raw` as a list of `kind`. A payload without a `kind` field is
    /// accepted; one naming a different kind is not.
    pub fn decode(kind: ResourceKind, raw: &[u8]) -> Result<Self, ListCodecError> {
        let list: ObjectList = serde_json::from_slice(raw)
            .map_err(|source| ListCodecError::Decode { kind, source })?;
        match list.kind.as_deref() {
            Some(found) if found != kind.list_kind() => Err(ListCodecError::UnexpectedKind {
                expected: kind.list_kind(),
                found: found.to_string(),
            }),
            _ => Ok(list),
        }
    }

    pub fn encode(&self, kind: ResourceKind) -> Result<Vec<u8>, ListCodecError> {
        serde_json::to_vec(self).map_err(|source| ListCodecError::Encode { kind, source })
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
