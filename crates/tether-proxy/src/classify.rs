use std::fmt;

use axum::http::{Method, Uri};
use tether_common::ResourceKind;

pub const PASSTHROUGH_SELECTOR: &str = "type=benchmark";
pub const FUNCTIONAL_SELECTOR: &str = "type=functional";
pub const FILTER_SELECTOR: &str = "type=filter";
pub const VOLATILE_SELECTOR: &str = "type=resourceusage";
pub const DURABLE_SELECTOR: &str = "type=consistency";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Watch,
    Create,
    Update,
    Patch,
    Delete,
    DeleteCollection,
    Other,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Watch => "watch",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Patch => "patch",
            Verb::Delete => "delete",
            Verb::DeleteCollection => "deletecollection",
            Verb::Other => "other",
        }
    }

    /// Verbs served by an HTTP GET.
    pub fn is_read(&self) -> bool {
        matches!(self, Verb::Get | Verb::List | Verb::Watch)
    }

    fn from_method(method: &Method) -> Self {
        match *method {
            Method::GET | Method::HEAD => Verb::Get,
            Method::POST => Verb::Create,
            Method::PUT => Verb::Update,
            Method::PATCH => Verb::Patch,
            Method::DELETE => Verb::Delete,
            _ => Verb::Other,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caching/filtering policy requested through the label selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyClass {
    Passthrough,
    Functional,
    Filter,
    Volatile,
    Durable,
    /// No selector at all.
    Unselected,
    /// A selector that names none of the policy tokens.
    Other,
}

impl PolicyClass {
    /// Tokens are matched as substrings, first match wins.
    pub fn from_selector(selector: &str) -> Self {
        if selector.is_empty() {
            return PolicyClass::Unselected;
        }
        const ORDER: [(&str, PolicyClass); 5] = [
            (PASSTHROUGH_SELECTOR, PolicyClass::Passthrough),
            (FUNCTIONAL_SELECTOR, PolicyClass::Functional),
            (FILTER_SELECTOR, PolicyClass::Filter),
            (VOLATILE_SELECTOR, PolicyClass::Volatile),
            (DURABLE_SELECTOR, PolicyClass::Durable),
        ];
        ORDER
            .iter()
            .find(|(token, _)| selector.contains(token))
            .map(|(_, class)| *class)
            .unwrap_or(PolicyClass::Other)
    }
}

/// Everything the proxy needs to know about a request, resolved once when it
/// enters the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: Method,
    pub verb: Verb,
    pub is_resource_request: bool,
    pub api_group: String,
    pub api_version: String,
    pub namespace: String,
    pub resource: String,
    pub name: String,
    pub subresource: String,
    pub label_selector: String,
    pub policy: PolicyClass,
    /// Path and query as received.
    pub path: String,
}

impl RequestInfo {
    pub fn classify(method: &Method, uri: &Uri) -> Self {
        let query = parse_query(uri.query().unwrap_or(""));
        let label_selector = query
            .iter()
            .find(|(k, _)| k == "labelSelector")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let watch_param = query
            .iter()
            .any(|(k, v)| k == "watch" && (v == "true" || v == "1"));

        let mut info = RequestInfo {
            method: method.clone(),
            verb: Verb::from_method(method),
            is_resource_request: false,
            api_group: String::new(),
            api_version: String::new(),
            namespace: String::new(),
            resource: String::new(),
            name: String::new(),
            subresource: String::new(),
            policy: PolicyClass::from_selector(&label_selector),
            label_selector,
            path: uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| uri.path().to_string()),
        };

        let parts: Vec<&str> = uri
            .path()
            .trim_matches('/')
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();

        let rest = match parts.as_slice() {
            ["api", version, rest @ ..] => {
                info.api_version = version.to_string();
                rest
            }
            ["apis", group, version, rest @ ..] => {
                info.api_group = group.to_string();
                info.api_version = version.to_string();
                rest
            }
            _ => return info,
        };
        if rest.is_empty() {
            // discovery endpoints such as /api/v1
            info.api_group.clear();
            info.api_version.clear();
            return info;
        }
        info.is_resource_request = true;

        let mut rest = rest;
        if rest.len() > 1 && rest[0] == "watch" {
            info.verb = Verb::Watch;
            rest = &rest[1..];
        }

        if rest[0] == "namespaces" && rest.len() > 1 {
            info.namespace = rest[1].to_string();
            if rest.len() > 2 && !matches!(rest[2], "status" | "finalize") {
                rest = &rest[2..];
            }
        }

        info.resource = rest[0].to_string();
        if let Some(name) = rest.get(1) {
            info.name = name.to_string();
        }
        if let Some(sub) = rest.get(2) {
            info.subresource = sub.to_string();
        }
        if info.name.is_empty() {
            info.verb = match info.verb {
                Verb::Get if watch_param => Verb::Watch,
                Verb::Get => Verb::List,
                Verb::Delete => Verb::DeleteCollection,
                other => other,
            };
        }
        info
    }

    /// The resource kind when this is a GET `list` of a supported resource.
    /// HEAD lists resolve to the same verb but carry no body to cache.
    pub fn supported_list(&self) -> Option<ResourceKind> {
        if self.method != Method::GET || self.verb != Verb::List || !self.subresource.is_empty() {
            return None;
        }
        self.resource.parse().ok()
    }
}

impl fmt::Display for RequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_resource_request {
            return write!(f, "{} {}", self.verb, self.path);
        }
        write!(f, "{} {}", self.verb, self.resource)?;
        if !self.subresource.is_empty() {
            write!(f, "/{}", self.subresource)?;
        }
        write!(f, ": {}", self.path)
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(k), decode_component(v))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(method: Method, uri: &str) -> RequestInfo {
        RequestInfo::classify(&method, &uri.parse().unwrap())
    }

    #[test]
    fn namespaced_list() {
        let info = classify(
            Method::GET,
            "/api/v1/namespaces/default/configmaps?labelSelector=type%3Dfilter",
        );
        assert!(info.is_resource_request);
        assert_eq!(info.verb, Verb::List);
        assert_eq!(info.api_group, "");
        assert_eq!(info.api_version, "v1");
        assert_eq!(info.namespace, "default");
        assert_eq!(info.resource, "configmaps");
        assert_eq!(info.label_selector, "type=filter");
        assert_eq!(info.policy, PolicyClass::Filter);
        assert_eq!(info.supported_list(), Some(ResourceKind::ConfigMaps));
    }

    #[test]
    fn head_list_is_not_cacheable() {
        let uri = "/api/v1/namespaces/default/pods?labelSelector=type=resourceusage";
        let head = classify(Method::HEAD, uri);
        assert_eq!(head.verb, Verb::List);
        assert_eq!(head.supported_list(), None);
        assert_eq!(classify(Method::GET, uri).supported_list(), Some(ResourceKind::Pods));
    }

    #[test]
    fn named_get_and_subresource() {
        let info = classify(Method::GET, "/api/v1/namespaces/kube-system/pods/web-1/log");
        assert_eq!(info.verb, Verb::Get);
        assert_eq!(info.name, "web-1");
        assert_eq!(info.subresource, "log");
        assert_eq!(info.supported_list(), None);
    }

    #[test]
    fn group_resources() {
        let info = classify(Method::GET, "/apis/apps/v1/deployments");
        assert_eq!(info.api_group, "apps");
        assert_eq!(info.api_version, "v1");
        assert_eq!(info.namespace, "");
        assert_eq!(info.verb, Verb::List);
        assert_eq!(info.supported_list(), None);
    }

    #[test]
    fn watch_forms() {
        let info = classify(Method::GET, "/api/v1/namespaces/default/pods?watch=true");
        assert_eq!(info.verb, Verb::Watch);
        let info = classify(Method::GET, "/api/v1/pods?watch=1&labelSelector=type=consistency");
        assert_eq!(info.verb, Verb::Watch);
        assert_eq!(info.policy, PolicyClass::Durable);
        let info = classify(Method::GET, "/api/v1/watch/namespaces/default/pods");
        assert_eq!(info.verb, Verb::Watch);
        assert_eq!(info.namespace, "default");
        assert_eq!(info.resource, "pods");
        let info = classify(Method::GET, "/api/v1/pods?watch=false");
        assert_eq!(info.verb, Verb::List);
    }

    #[test]
    fn write_verbs() {
        assert_eq!(classify(Method::POST, "/api/v1/namespaces/default/pods").verb, Verb::Create);
        assert_eq!(classify(Method::PUT, "/api/v1/namespaces/default/pods/a").verb, Verb::Update);
        assert_eq!(classify(Method::PATCH, "/api/v1/namespaces/default/pods/a").verb, Verb::Patch);
        assert_eq!(classify(Method::DELETE, "/api/v1/namespaces/default/pods/a").verb, Verb::Delete);
        assert_eq!(
            classify(Method::DELETE, "/api/v1/namespaces/default/pods").verb,
            Verb::DeleteCollection
        );
    }

    #[test]
    fn namespace_object_and_status() {
        let info = classify(Method::GET, "/api/v1/namespaces/default");
        assert_eq!(info.resource, "namespaces");
        assert_eq!(info.name, "default");
        assert_eq!(info.verb, Verb::Get);

        let info = classify(Method::PUT, "/api/v1/namespaces/default/status");
        assert_eq!(info.resource, "namespaces");
        assert_eq!(info.subresource, "status");
    }

    #[test]
    fn non_resource_paths() {
        for path in ["/livez", "/version", "/api", "/api/v1", "/apis/apps/v1", "/"] {
            let info = classify(Method::GET, path);
            assert!(!info.is_resource_request, "{path}");
        }
    }

    #[test]
    fn policy_classes() {
        assert_eq!(PolicyClass::from_selector(""), PolicyClass::Unselected);
        assert_eq!(PolicyClass::from_selector("type=benchmark"), PolicyClass::Passthrough);
        assert_eq!(PolicyClass::from_selector("type=functional"), PolicyClass::Functional);
        assert_eq!(PolicyClass::from_selector("type=resourceusage"), PolicyClass::Volatile);
        assert_eq!(PolicyClass::from_selector("app=web,type=consistency"), PolicyClass::Durable);
        assert_eq!(PolicyClass::from_selector("app=web"), PolicyClass::Other);
        // earlier tokens win
        assert_eq!(
            PolicyClass::from_selector("type=consistency,type=benchmark"),
            PolicyClass::Passthrough
        );
    }

    #[test]
    fn display_names_the_request() {
        let info = classify(Method::GET, "/api/v1/namespaces/default/configmaps");
        assert_eq!(info.to_string(), "list configmaps: /api/v1/namespaces/default/configmaps");
        let info = classify(Method::GET, "/version");
        assert_eq!(info.to_string(), "get /version");
    }
}
