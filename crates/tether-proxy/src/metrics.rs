use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};

use tracing::Instrument;

use crate::state::AppState;

/// In-process request counters.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    /// Requests answered by the local proxy while the upstream was unhealthy.
    pub fallback_total: AtomicU64,
    pub volatile_requests_total: AtomicU64,
    pub volatile_hits_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_inflight: u64,
    pub status_2xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub fallback_total: u64,
    pub volatile_requests_total: u64,
    pub volatile_hits_total: u64,
}

impl Metrics {
    pub fn record_fallback(&self) {
        self.fallback_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_volatile_request(&self) {
        self.volatile_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_volatile_hit(&self) {
        self.volatile_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_inflight: self.requests_inflight.load(Ordering::Relaxed),
            status_2xx: self.status_2xx.load(Ordering::Relaxed),
            status_4xx: self.status_4xx.load(Ordering::Relaxed),
            status_5xx: self.status_5xx.load(Ordering::Relaxed),
            fallback_total: self.fallback_total.load(Ordering::Relaxed),
            volatile_requests_total: self.volatile_requests_total.load(Ordering::Relaxed),
            volatile_hits_total: self.volatile_hits_total.load(Ordering::Relaxed),
        }
    }

    fn record_status(&self, status: u16) {
        if status >= 500 {
            self.status_5xx.fetch_add(1, Ordering::Relaxed);
        } else if status >= 400 {
            self.status_4xx.fetch_add(1, Ordering::Relaxed);
        } else if status >= 200 {
            self.status_2xx.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let span = tracing::debug_span!("request", id = %uuid::Uuid::new_v4());

    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).instrument(span.clone()).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    st.metrics.record_status(status);
    tracing::debug!(
        parent: &span,
        %method,
        path = %path,
        status,
        latency_ms = start.elapsed().as_millis() as u64,
        "request served"
    );

    Ok(resp)
}
