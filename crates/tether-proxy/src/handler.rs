use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware,
    response::Response,
    Router,
};
use tether_store::Store;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheManager;
use crate::classify::{PolicyClass, RequestInfo};
use crate::config::{HandlerKind, ProxyConfig, UpstreamTarget};
use crate::filter::SKIP_PREFIX;
use crate::health::HealthChecker;
use crate::local::LocalProxy;
use crate::metrics::{track_requests, Metrics};
use crate::remote::{RemoteOptions, RemoteProxy};
use crate::state::AppState;
use crate::transport::{Forwarder, RoundTripper};

/// The request handler mounted on the listener.
pub enum EdgeHandler {
    /// Remote proxy while the upstream is healthy, local cache otherwise.
    Dev {
        remote: Arc<RemoteProxy>,
        local: Arc<LocalProxy>,
    },
    Sample { forwarder: Forwarder },
}

impl EdgeHandler {
    /// Build the full handler. Probes the upstream once before returning;
    /// the returned task keeps probing until `cancel` fires.
    pub async fn dev(
        config: &ProxyConfig,
        transport: Arc<dyn RoundTripper>,
        store: Arc<dyn Store>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let checker = HealthChecker::new(
            config.upstream.clone(),
            Arc::clone(&transport),
            config.health_interval,
            config.health_timeout,
            cancel,
        );
        let health_loop = checker.start().await;

        let cache = Arc::new(CacheManager::new(store));
        let remote = RemoteProxy::new(
            Forwarder::new(config.upstream.clone(), transport),
            checker,
            Arc::clone(&cache),
            metrics,
            RemoteOptions {
                tee_buffer_chunks: config.tee_buffer_chunks,
                populate_wait: config.populate_wait,
                filter_prefix: SKIP_PREFIX.to_string(),
            },
        );
        let handler = EdgeHandler::Dev {
            remote: Arc::new(remote),
            local: Arc::new(LocalProxy::new(cache)),
        };
        (handler, health_loop)
    }

    pub fn sample(upstream: UpstreamTarget, transport: Arc<dyn RoundTripper>) -> Self {
        EdgeHandler::Sample {
            forwarder: Forwarder::new(upstream, transport),
        }
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            EdgeHandler::Dev { .. } => HandlerKind::Dev,
            EdgeHandler::Sample { .. } => HandlerKind::Sample,
        }
    }
}

pub async fn proxy_handler(State(st): State<AppState>, req: Request<Body>) -> Response {
    match st.handler.as_ref() {
        EdgeHandler::Sample { forwarder } => forwarder.forward(req).await,
        EdgeHandler::Dev { remote, local } => {
            let info = RequestInfo::classify(req.method(), req.uri());
            if info.policy == PolicyClass::Volatile {
                st.metrics.record_volatile_request();
            }
            if remote.is_healthy() {
                remote.serve(req, &info).await
            } else {
                st.metrics.record_fallback();
                local.serve(&info).await
            }
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}
