mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tether_proxy::metrics::Metrics;
use tether_proxy::{build_router, AppState, EdgeHandler, HandlerKind, ReqwestTransport, RoundTripper};
use tether_store::DiskStore;
use tokio_util::sync::CancellationToken;

use crate::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel = tether_common::telemetry::init_tracing(&args.telemetry());

    let config = args.to_config()?;
    let http = build_http_client(&args)?;
    let transport: Arc<dyn RoundTripper> = Arc::new(ReqwestTransport::new(http));
    let metrics = Arc::new(Metrics::default());
    let cancel = CancellationToken::new();

    let (handler, health_loop) = match config.handler {
        HandlerKind::Sample => (EdgeHandler::sample(config.upstream.clone(), transport), None),
        HandlerKind::Dev => {
            let store = DiskStore::new(&config.disk_cache_path)
                .await
                .with_context(|| {
                    format!("failed to open cache dir {}", config.disk_cache_path.display())
                })?;
            let (handler, health_loop) = EdgeHandler::dev(
                &config,
                transport,
                Arc::new(store),
                Arc::clone(&metrics),
                cancel.clone(),
            )
            .await;
            (handler, Some(health_loop))
        }
    };
    tracing::info!(
        upstream=%config.upstream,
        listen=%config.listen_addr,
        handler=?handler.kind(),
        "tether proxy starting"
    );

    let st = AppState {
        handler: Arc::new(handler),
        metrics: Arc::clone(&metrics),
    };
    let app = build_router(st);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error=%e, "failed to listen for shutdown signal");
            }
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    if let Some(handle) = health_loop {
        let _ = handle.await;
    }
    tracing::info!(metrics=?metrics.snapshot(), "tether proxy stopped");
    if let Some(provider) = otel {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush traces: {e}");
        }
    }
    Ok(())
}

fn build_http_client(args: &Args) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .danger_accept_invalid_certs(args.insecure_skip_tls_verify);

    if let Some(path) = &args.ca_file {
        let pem = std::fs::read(path)
            .with_context(|| format!("failed to read CA file {}", path.display()))?;
        for cert in reqwest::Certificate::from_pem_bundle(&pem)? {
            builder = builder.add_root_certificate(cert);
        }
    }

    if let Some(path) = &args.bearer_token_file {
        let token = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read token file {}", path.display()))?;
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))?;
        value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        builder = builder.default_headers(headers);
    }

    Ok(builder.build()?)
}
