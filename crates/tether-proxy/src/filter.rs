use bytes::Bytes;
use tether_common::{ListCodecError, ObjectList, ResourceKind, UnsupportedResource};

/// Items whose name starts with this prefix are dropped from filtered lists.
pub const SKIP_PREFIX: &str = "skip-";

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error(transparent)]
    UnsupportedResource(#[from] UnsupportedResource),
    #[error(transparent)]
    Codec(#[from] ListCodecError),
}

#[derive(Debug, Clone)]
pub struct Filtered {
    pub body: Bytes,
    pub retained: usize,
    pub removed: usize,
}

impl Filtered {
    pub fn content_length(&self) -> usize {
        self.body.len()
    }
}

/// Decode `raw` as a list of `resource`, drop every item whose name starts
/// with `exclude_prefix` and re-encode. An empty prefix drops nothing.
pub fn apply_policy(resource: &str, raw: &[u8], exclude_prefix: &str) -> Result<Filtered, FilterError> {
    let kind: ResourceKind = resource.parse()?;
    let mut list = ObjectList::decode(kind, raw)?;

    let before = list.items.len();
    if !exclude_prefix.is_empty() {
        list.items
            .retain(|item| !item.metadata.name.starts_with(exclude_prefix));
    }
    let retained = list.items.len();

    let body = Bytes::from(list.encode(kind)?);
    Ok(Filtered {
        body,
        retained,
        removed: before - retained,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    const CONFIGMAPS: &[u8] = br#"{
        "kind": "ConfigMapList",
        "apiVersion": "v1",
        "metadata": {"resourceVersion": "7"},
        "items": [
            {"metadata": {"name": "skip-a"}, "data": {"x": "1"}},
            {"metadata": {"name": "b"}, "data": {"x": "2"}},
            {"metadata": {"name": "skip-c"}}
        ]
    }"#;

    #[test]
    fn drops_prefixed_items() {
        let out = apply_policy("configmaps", CONFIGMAPS, SKIP_PREFIX).unwrap();
        assert_eq!(out.retained, 1);
        assert_eq!(out.removed, 2);
        assert_eq!(out.content_length(), out.body.len());

        let v: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(v["kind"], "ConfigMapList");
        assert_eq!(v["metadata"]["resourceVersion"], "7");
        assert_eq!(v["items"].as_array().unwrap().len(), 1);
        assert_eq!(v["items"][0]["metadata"]["name"], "b");
        assert_eq!(v["items"][0]["data"]["x"], "2");
    }

    #[test]
    fn keeps_everything_without_matches() {
        let raw = br#"{"kind":"PodList","items":[{"metadata":{"name":"web"}}]}"#;
        let out = apply_policy("pods", raw, SKIP_PREFIX).unwrap();
        assert_eq!((out.retained, out.removed), (1, 0));

        let out = apply_policy("pods", raw, "").unwrap();
        assert_eq!(out.removed, 0);
    }

    #[test]
    fn empty_list_stays_empty() {
        let raw = br#"{"kind":"PodList","items":[]}"#;
        let out = apply_policy("pods", raw, SKIP_PREFIX).unwrap();
        let v: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(v["items"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn rejects_unknown_resource_and_bad_payloads() {
        assert!(matches!(
            apply_policy("secrets", CONFIGMAPS, SKIP_PREFIX),
            Err(FilterError::UnsupportedResource(_))
        ));
        assert!(matches!(
            apply_policy("pods", CONFIGMAPS, SKIP_PREFIX),
            Err(FilterError::Codec(ListCodecError::UnexpectedKind { .. }))
        ));
        assert!(matches!(
            apply_policy("pods", b"<html>", SKIP_PREFIX),
            Err(FilterError::Codec(ListCodecError::Decode { .. }))
        ));
    }
}
