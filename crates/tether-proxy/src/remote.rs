use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, response::Parts, HeaderMap, HeaderValue, Request},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tether_store::StoreError;
use tokio::sync::OwnedMutexGuard;

use crate::body::{body_stream, json_response, read_all};
use crate::cache::{CacheError, CacheKey, CacheManager, CacheOutcome, QueryClass};
use crate::classify::{PolicyClass, RequestInfo, Verb};
use crate::decompress;
use crate::error::ProxyError;
use crate::filter::{self, SKIP_PREFIX};
use crate::health::HealthChecker;
use crate::metrics::Metrics;
use crate::tee::tee;
use crate::transport::{is_upgrade_request, response_from_upstream, Forwarder};

#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Chunks the tee may buffer ahead of the caching task.
    pub tee_buffer_chunks: usize,
    /// How long a volatile request waits for another request populating the
    /// same key before going upstream itself.
    pub populate_wait: Duration,
    pub filter_prefix: String,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            tee_buffer_chunks: 16,
            populate_wait: Duration::from_millis(5000),
            filter_prefix: SKIP_PREFIX.to_string(),
        }
    }
}

/// Serves requests from the upstream while it is healthy, rewriting and
/// caching list responses on the way back.
pub struct RemoteProxy {
    forwarder: Forwarder,
    checker: Arc<HealthChecker>,
    cache: Arc<CacheManager>,
    metrics: Arc<Metrics>,
    options: RemoteOptions,
}

impl RemoteProxy {
    pub fn new(
        forwarder: Forwarder,
        checker: Arc<HealthChecker>,
        cache: Arc<CacheManager>,
        metrics: Arc<Metrics>,
        options: RemoteOptions,
    ) -> Self {
        Self {
            forwarder,
            checker,
            cache,
            metrics,
            options,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.checker.is_healthy()
    }

    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    pub async fn serve(&self, req: Request<Body>, info: &RequestInfo) -> Response {
        if is_upgrade_request(req.headers()) {
            tracing::info!(request=%info, "forward upgrade request");
            return self.forwarder.forward_upgrade(req).await;
        }
        if info.policy == PolicyClass::Volatile {
            if let Some(key) = CacheKey::for_request(info) {
                return self.serve_volatile(req, info, key).await;
            }
        }
        self.proxy(req, info, None).await
    }

    async fn serve_volatile(&self, req: Request<Body>, info: &RequestInfo, key: CacheKey) -> Response {
        if let Some(cached) = self.cache.query_volatile(&key) {
            self.metrics.record_volatile_hit();
            return json_response(axum::http::StatusCode::OK, cached);
        }

        let guard = match self.cache.population_gate(&key) {
            Some(gate) => {
                match tokio::time::timeout(self.options.populate_wait, gate.lock_owned()).await {
                    Ok(guard) => Some(guard),
                    Err(_) => {
                        tracing::debug!(key=%key, "timed out waiting for volatile population");
                        None
                    }
                }
            }
            // populated since the first look
            None => None,
        };
        if let Some(cached) = self.cache.query_volatile(&key) {
            self.metrics.record_volatile_hit();
            return json_response(axum::http::StatusCode::OK, cached);
        }
        self.proxy(req, info, guard).await
    }

    async fn proxy(
        &self,
        req: Request<Body>,
        info: &RequestInfo,
        gate: Option<OwnedMutexGuard<()>>,
    ) -> Response {
        let upstream = match self.forwarder.send(req).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::error!(request=%info, error=%e, "remote proxy error");
                return e.into_response();
            }
        };
        let resp = response_from_upstream(upstream);
        match self.modify_response(resp, info, gate).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(request=%info, error=%e, "remote proxy error");
                e.into_response()
            }
        }
    }

    async fn modify_response(
        &self,
        resp: Response,
        info: &RequestInfo,
        gate: Option<OwnedMutexGuard<()>>,
    ) -> Result<Response, ProxyError> {
        if info.policy == PolicyClass::Passthrough {
            return Ok(resp);
        }
        let (mut parts, body) = resp.into_parts();

        // the hop-by-hop strip drops this, but watch clients rely on it
        if info.verb == Verb::Watch
            && !parts.headers.contains_key(header::TRANSFER_ENCODING)
            && !parts.headers.contains_key(header::CONTENT_LENGTH)
        {
            parts
                .headers
                .insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }

        if !(200..=206).contains(&parts.status.as_u16()) {
            return Ok(Response::from_parts(parts, body));
        }
        let Some(kind) = info.supported_list() else {
            return Ok(Response::from_parts(parts, body));
        };

        if info.policy == PolicyClass::Filter {
            return self.filter_body(parts, body, info, kind.as_str()).await;
        }
        match CacheKey::for_request(info) {
            Some(key) => Ok(self.tee_into_cache(parts, body, info, key, gate)),
            None => Ok(Response::from_parts(parts, body)),
        }
    }

    async fn filter_body(
        &self,
        mut parts: Parts,
        body: Body,
        info: &RequestInfo,
        resource: &str,
    ) -> Result<Response, ProxyError> {
        let (decoded, decompressed) = decompress::wrap(&parts.headers, body_stream(body));
        let raw = read_all(decoded)
            .await
            .map_err(|e| ProxyError::modification(info, e))?;
        let filtered = filter::apply_policy(resource, &raw, &self.options.filter_prefix)
            .map_err(|e| ProxyError::from_filter(info, e))?;

        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(filtered.content_length()));
        if decompressed {
            parts.headers.remove(header::CONTENT_ENCODING);
        }
        tracing::debug!(
            request=%info,
            retained = filtered.retained,
            removed = filtered.removed,
            "filtered list response"
        );
        Ok(Response::from_parts(parts, Body::from(filtered.body)))
    }

    fn tee_into_cache(
        &self,
        parts: Parts,
        body: Body,
        info: &RequestInfo,
        key: CacheKey,
        gate: Option<OwnedMutexGuard<()>>,
    ) -> Response {
        let durable = key.query_class != QueryClass::ResourceUsage;
        if durable && self.cache.is_durable_populated(&key) {
            return Response::from_parts(parts, body);
        }
        if !is_json(&parts.headers) {
            tracing::debug!(request=%info, "skip caching non-json response");
            return Response::from_parts(parts, body);
        }

        let declared_len = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let (foreground, background) = tee(
            body_stream(body),
            self.options.tee_buffer_chunks,
            declared_len,
        );
        let headers = parts.headers.clone();
        let cache = Arc::clone(&self.cache);
        let request = info.to_string();
        tokio::spawn(async move {
            let _gate = gate;
            let (decoded, _) = decompress::wrap(&headers, background.boxed());
            match read_all(decoded).await {
                Ok(raw) => store_response(&cache, &key, raw, &request).await,
                Err(e) => {
                    let err = CacheError::Read(e.to_string());
                    tracing::warn!(request = %request, error=%err, "failed to cache response");
                }
            }
        });
        Response::from_parts(parts, Body::from_stream(foreground))
    }
}

async fn store_response(cache: &CacheManager, key: &CacheKey, raw: Bytes, request: &str) {
    if key.query_class == QueryClass::ResourceUsage {
        if cache.cache_list_volatile(key, raw) {
            tracing::debug!(key=%key, request, "volatile cache populated");
        }
        return;
    }
    match cache.cache_list(key, &raw).await {
        Ok(CacheOutcome::Stored { items }) => {
            tracing::debug!(key=%key, request, items, "cached list response")
        }
        Ok(CacheOutcome::AlreadyCached) => {}
        Err(CacheError::Store(StoreError::Conflict)) => {
            tracing::debug!(key=%key, request, "another request is populating the cache")
        }
        Err(e) => tracing::warn!(key=%key, request, error=%e, "failed to cache response"),
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("json"))
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_compression::tokio::bufread::GzipEncoder;
    use axum::http::StatusCode;
    use serde_json::Value;
    use tether_store::{MemoryStore, Store};
    use tokio::io::AsyncReadExt;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::UpstreamTarget;
    use crate::transport::testing::MockTransport;

    const CONFIGMAPS: &str = r#"{"kind":"ConfigMapList","apiVersion":"v1","metadata":{},"items":[
        {"metadata":{"name":"skip-a","labels":{"type":"consistency"}}},
        {"metadata":{"name":"b","labels":{"type":"consistency"}}},
        {"metadata":{"name":"c"}}
    ]}"#;

    struct Fixture {
        remote: RemoteProxy,
        cache: Arc<CacheManager>,
        store: Arc<MemoryStore>,
        mock: Arc<MockTransport>,
    }

    fn fixture(mock: Arc<MockTransport>) -> Fixture {
        let target = UpstreamTarget::parse("http://upstream:6443").unwrap();
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CacheManager::new(store.clone()));
        let checker = HealthChecker::new(
            target.clone(),
            mock.clone(),
            Duration::from_secs(10),
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        let remote = RemoteProxy::new(
            Forwarder::new(target, mock.clone()),
            checker,
            cache.clone(),
            Arc::new(Metrics::default()),
            RemoteOptions::default(),
        );
        Fixture {
            remote,
            cache,
            store,
            mock,
        }
    }

    fn json_upstream(body: &'static str) -> Arc<MockTransport> {
        MockTransport::new(move |_| {
            Ok(http::Response::builder()
                .header("content-type", "application/json")
                .body(Bytes::from_static(body.as_bytes()))
                .unwrap())
        })
    }

    async fn get(f: &Fixture, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let info = RequestInfo::classify(req.method(), req.uri());
        let resp = f.remote.serve(req, &info).await;
        let (parts, body) = resp.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        (parts.status, parts.headers, body)
    }

    fn names(raw: &[u8]) -> Vec<String> {
        let v: Value = serde_json::from_slice(raw).unwrap();
        v["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["metadata"]["name"].as_str().unwrap().to_string())
            .collect()
    }

    async fn wait_for_key(store: &MemoryStore, key: &str) -> Bytes {
        for _ in 0..100 {
            if let Ok(v) = store.get(key).await {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{key} was never cached");
    }

    #[tokio::test]
    async fn filter_removes_prefixed_items() {
        let f = fixture(json_upstream(CONFIGMAPS));
        let (status, headers, body) = get(
            &f,
            "/api/v1/namespaces/default/configmaps?labelSelector=type%3Dfilter",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(names(&body), vec!["b", "c"]);
        assert_eq!(headers[header::CONTENT_LENGTH], body.len().to_string().as_str());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn filter_decodes_gzip() {
        let mut gz = Vec::new();
        GzipEncoder::new(CONFIGMAPS.as_bytes())
            .read_to_end(&mut gz)
            .await
            .unwrap();
        let gz = Bytes::from(gz);
        let mock = MockTransport::new(move |_| {
            Ok(http::Response::builder()
                .header("content-type", "application/json")
                .header("content-encoding", "gzip")
                .body(gz.clone())
                .unwrap())
        });
        let f = fixture(mock);
        let (status, headers, body) =
            get(&f, "/api/v1/namespaces/default/configmaps?labelSelector=type=filter").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!headers.contains_key(header::CONTENT_ENCODING));
        assert_eq!(names(&body), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn undecodable_filter_payload_is_bad_gateway() {
        let f = fixture(json_upstream("<html>oops</html>"));
        let (status, _, body) =
            get(&f, "/api/v1/namespaces/default/pods?labelSelector=type=filter").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["kind"], "Status");
    }

    #[tokio::test]
    async fn durable_list_is_cached_in_background() {
        let f = fixture(json_upstream(CONFIGMAPS));
        let (status, _, body) = get(
            &f,
            "/api/v1/namespaces/default/configmaps?labelSelector=type=consistency",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(names(&body), vec!["skip-a", "b", "c"]);

        let cached = wait_for_key(&f.store, "cache/configmaps/default/consistency").await;
        assert_eq!(names(&cached), vec!["skip-a", "b"]);
    }

    #[tokio::test]
    async fn unselected_list_caches_everything() {
        let f = fixture(json_upstream(CONFIGMAPS));
        get(&f, "/api/v1/namespaces/default/configmaps").await;
        let cached = wait_for_key(&f.store, "cache/configmaps/default/default").await;
        assert_eq!(names(&cached), vec!["skip-a", "b", "c"]);
    }

    #[tokio::test]
    async fn functional_and_error_responses_are_not_cached() {
        let f = fixture(json_upstream(CONFIGMAPS));
        get(
            &f,
            "/api/v1/namespaces/default/configmaps?labelSelector=type=functional",
        )
        .await;

        let failing = MockTransport::new(|_| {
            Ok(http::Response::builder()
                .status(500)
                .header("content-type", "application/json")
                .body(Bytes::from_static(CONFIGMAPS.as_bytes()))
                .unwrap())
        });
        let g = fixture(failing);
        let (status, _, _) = get(&g, "/api/v1/namespaces/default/configmaps").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.store.is_empty().await);
        assert!(g.store.is_empty().await);
    }

    #[tokio::test]
    async fn volatile_served_from_memory_after_first_fetch() {
        let f = fixture(json_upstream(CONFIGMAPS));
        let uri = "/api/v1/namespaces/default/configmaps?labelSelector=type=resourceusage";

        let (_, _, first) = get(&f, uri).await;
        let key = CacheKey::for_request(&RequestInfo::classify(
            &axum::http::Method::GET,
            &uri.parse().unwrap(),
        ))
        .unwrap();
        for _ in 0..100 {
            if f.cache.query_volatile(&key).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (status, headers, second) = get(&f, uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(first, second);
        assert_eq!(f.mock.calls(), 1);
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_volatile_requests_share_one_population() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let mock = MockTransport::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(http::Response::builder()
                .header("content-type", "application/json")
                .body(Bytes::from_static(CONFIGMAPS.as_bytes()))
                .unwrap())
        });
        let f = Arc::new(fixture(mock));
        let uri = "/api/v1/namespaces/default/configmaps?labelSelector=type=resourceusage";

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let f = Arc::clone(&f);
            tasks.push(tokio::spawn(async move { get(&f, uri).await }));
        }
        for t in tasks {
            let (status, _, body) = t.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert_eq!(names(&body).len(), 3);
        }
        assert!(hits.load(Ordering::SeqCst) >= 1);
        assert!(hits.load(Ordering::SeqCst) < 20);
    }

    #[tokio::test]
    async fn watch_responses_get_chunked_header() {
        let f = fixture(json_upstream(""));
        let (_, headers, _) = get(&f, "/api/v1/namespaces/default/pods?watch=true").await;
        assert_eq!(headers[header::TRANSFER_ENCODING], "chunked");

        let (_, headers, _) = get(
            &f,
            "/api/v1/namespaces/default/pods?watch=true&labelSelector=type=benchmark",
        )
        .await;
        assert!(!headers.contains_key(header::TRANSFER_ENCODING));
    }

    #[tokio::test]
    async fn head_list_leaves_volatile_tier_empty() {
        let mock = MockTransport::new(|req| {
            let body = if req.method() == reqwest::Method::HEAD {
                Bytes::new()
            } else {
                Bytes::from_static(CONFIGMAPS.as_bytes())
            };
            Ok(http::Response::builder()
                .header("content-type", "application/json")
                .body(body)
                .unwrap())
        });
        let f = fixture(mock);
        let uri = "/api/v1/namespaces/default/configmaps?labelSelector=type=resourceusage";

        let req = Request::builder()
            .method(axum::http::Method::HEAD)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let info = RequestInfo::classify(req.method(), req.uri());
        let resp = f.remote.serve(req, &info).await;
        assert_eq!(resp.status(), StatusCode::OK);
        axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let (status, _, body) = get(&f, uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(names(&body).len(), 3);
        assert_eq!(f.mock.calls(), 2);
    }
}
