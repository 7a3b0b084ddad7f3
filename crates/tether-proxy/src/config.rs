use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no upstream server address configured")]
    NoServer,
    #[error("invalid server address '{addr}': {reason}")]
    InvalidServer { addr: String, reason: String },
    #[error("invalid request path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("{0}")]
    UnknownHandler(String),
}

/// Base URL of the upstream API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    base: Url,
}

impl UpstreamTarget {
    /// Parse a comma separated server list. Only the first entry is used;
    /// a missing scheme means `https`.
    pub fn parse(servers: &str) -> Result<Self, ConfigError> {
        let first = servers
            .split(',')
            .map(str::trim)
            .find(|s| !s.is_empty())
            .ok_or(ConfigError::NoServer)?;

        let with_scheme = if first.contains("://") {
            first.to_string()
        } else {
            format!("https://{first}")
        };
        let base = Url::parse(&with_scheme).map_err(|e| ConfigError::InvalidServer {
            addr: first.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidServer {
                addr: first.to_string(),
                reason: format!("unsupported scheme {}", base.scheme()),
            });
        }
        if base.host_str().is_none() {
            return Err(ConfigError::InvalidServer {
                addr: first.to_string(),
                reason: "missing host".to_string(),
            });
        }
        Ok(Self { base })
    }

    /// Absolute upstream URL for a request path (with optional query).
    pub fn url_for(&self, path_and_query: &str) -> Result<Url, ConfigError> {
        let base = self.base.as_str().trim_end_matches('/');
        let path = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{path_and_query}")
        };
        Url::parse(&format!("{base}{path}")).map_err(|e| ConfigError::InvalidPath {
            path: path_and_query.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        self.base.as_str()
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.base.as_str().trim_end_matches('/'))
    }
}

/// Which request handler the proxy mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerKind {
    /// Health-aware proxy with filtering, caching and local fallback.
    #[default]
    Dev,
    /// Plain forwarding proxy.
    Sample,
}

impl FromStr for HandlerKind {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "dev" => Ok(HandlerKind::Dev),
            "sample" => Ok(HandlerKind::Sample),
            other => Err(ConfigError::UnknownHandler(format!(
                "unknown handler '{}', available: dev, sample",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub upstream: UpstreamTarget,
    pub listen_addr: String,
    pub disk_cache_path: PathBuf,
    pub handler: HandlerKind,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub tee_buffer_chunks: usize,
    pub populate_wait: Duration,
}

impl ProxyConfig {
    pub fn new(upstream: UpstreamTarget) -> Self {
        Self {
            upstream,
            listen_addr: "127.0.0.1:10261".to_string(),
            disk_cache_path: PathBuf::from("/etc/kubernetes/cache/"),
            handler: HandlerKind::Dev,
            health_interval: Duration::from_secs(10),
            health_timeout: Duration::from_secs(3),
            tee_buffer_chunks: 16,
            populate_wait: Duration::from_millis(5000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_lists() {
        let t = UpstreamTarget::parse("10.0.0.1:6443").unwrap();
        assert_eq!(t.to_string(), "https://10.0.0.1:6443");

        let t = UpstreamTarget::parse(" http://a:8080 , https://b:6443").unwrap();
        assert_eq!(t.to_string(), "http://a:8080");

        assert!(matches!(UpstreamTarget::parse(""), Err(ConfigError::NoServer)));
        assert!(matches!(UpstreamTarget::parse(" , "), Err(ConfigError::NoServer)));
        assert!(matches!(
            UpstreamTarget::parse("ftp://a"),
            Err(ConfigError::InvalidServer { .. })
        ));
    }

    #[test]
    fn joins_request_paths() {
        let t = UpstreamTarget::parse("http://127.0.0.1:6443/").unwrap();
        let url = t
            .url_for("/api/v1/namespaces/default/pods?labelSelector=type%3Dfilter")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:6443/api/v1/namespaces/default/pods?labelSelector=type%3Dfilter"
        );
        assert_eq!(t.url_for("livez").unwrap().path(), "/livez");
    }

    #[test]
    fn handler_names() {
        assert_eq!("dev".parse::<HandlerKind>().unwrap(), HandlerKind::Dev);
        assert_eq!("sample".parse::<HandlerKind>().unwrap(), HandlerKind::Sample);
        let err = "fancy".parse::<HandlerKind>().unwrap_err();
        assert!(err.to_string().contains("available: dev, sample"));
    }
}
