use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, Request, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::TryStreamExt;
use hyper_util::rt::TokioIo;

use crate::config::UpstreamTarget;
use crate::error::ProxyError;

/// Sends one request to the upstream. The seam tests swap out.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, req: reqwest::Request) -> Result<reqwest::Response, ProxyError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RoundTripper for ReqwestTransport {
    async fn round_trip(&self, req: reqwest::Request) -> Result<reqwest::Response, ProxyError> {
        Ok(self.client.execute(req).await?)
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

fn has_body(headers: &HeaderMap) -> bool {
    let declared_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() != "0")
        .unwrap_or(false);
    declared_length || headers.contains_key(header::TRANSFER_ENCODING)
}

fn upstream_headers(headers: &HeaderMap, keep_upgrade: bool) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (k, v) in headers.iter() {
        if k == header::HOST || k == header::CONTENT_LENGTH {
            continue;
        }
        let upgrade_header = k == header::CONNECTION || k == header::UPGRADE;
        if is_hop_by_hop(k) && !(keep_upgrade && upgrade_header) {
            continue;
        }
        out.append(k.clone(), v.clone());
    }
    out
}

fn copy_response_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (k, v) in src.iter() {
        if is_hop_by_hop(k) {
            continue;
        }
        dst.append(k.clone(), v.clone());
    }
}

/// Turn an upstream response into a streaming client response. Hop-by-hop
/// headers are dropped.
pub fn response_from_upstream(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let stream = upstream.bytes_stream().map_err(std::io::Error::other);

    let mut out = Response::new(Body::from_stream(stream));
    *out.status_mut() = status;
    copy_response_headers(&headers, out.headers_mut());
    out
}

/// Relays client requests to one upstream.
#[derive(Clone)]
pub struct Forwarder {
    target: UpstreamTarget,
    transport: Arc<dyn RoundTripper>,
}

impl Forwarder {
    pub fn new(target: UpstreamTarget, transport: Arc<dyn RoundTripper>) -> Self {
        Self { target, transport }
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    pub fn transport(&self) -> Arc<dyn RoundTripper> {
        Arc::clone(&self.transport)
    }

    pub async fn send(&self, req: Request<Body>) -> Result<reqwest::Response, ProxyError> {
        let keep_upgrade = is_upgrade_request(req.headers());
        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = self
            .target
            .url_for(path)
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

        let mut out = reqwest::Request::new(parts.method.clone(), url);
        *out.headers_mut() = upstream_headers(&parts.headers, keep_upgrade);
        if has_body(&parts.headers) {
            *out.body_mut() = Some(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        self.transport.round_trip(out).await
    }

    /// Forward without looking at the response. Transport failures become 502.
    pub async fn forward(&self, req: Request<Body>) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match self.send(req).await {
            Ok(upstream) => response_from_upstream(upstream),
            Err(e) => {
                tracing::error!(error=%e, %method, path=%path, "proxy request failed");
                e.into_response()
            }
        }
    }

    /// Forward an upgrade request. On `101` the client and upstream
    /// connections are spliced together once both sides have switched.
    pub async fn forward_upgrade(&self, mut req: Request<Body>) -> Response {
        let client_upgrade = hyper::upgrade::on(&mut req);
        let path = req.uri().path().to_string();

        let upstream = match self.send(req).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::error!(error=%e, path=%path, "upgrade request failed");
                return e.into_response();
            }
        };
        if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
            return response_from_upstream(upstream);
        }

        let mut out = Response::new(Body::empty());
        *out.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        for (k, v) in upstream.headers().iter() {
            out.headers_mut().append(k.clone(), v.clone());
        }

        tokio::spawn(async move {
            let mut upstream_io = match upstream.upgrade().await {
                Ok(io) => io,
                Err(e) => {
                    tracing::warn!(error=%e, path=%path, "upstream upgrade failed");
                    return;
                }
            };
            let mut client_io = match client_upgrade.await {
                Ok(io) => TokioIo::new(io),
                Err(e) => {
                    tracing::warn!(error=%e, path=%path, "client upgrade failed");
                    return;
                }
            };
            match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                Ok((to_upstream, to_client)) => {
                    tracing::debug!(path=%path, to_upstream, to_client, "upgraded connection closed")
                }
                Err(e) => tracing::debug!(error=%e, path=%path, "upgraded connection ended"),
            }
        });
        out
    }
}
