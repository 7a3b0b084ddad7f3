use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Method;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::UpstreamTarget;
use crate::transport::RoundTripper;

pub const LIVENESS_PATH: &str = "/livez";
const LIVENESS_OK: &[u8] = b"ok";

#[derive(Debug, Clone)]
pub struct HealthState {
    pub is_healthy: bool,
    pub last_transition: DateTime<Utc>,
    /// Number of healthy to unhealthy transitions seen so far.
    pub unhealthy_transitions: u64,
}

/// Polls the upstream liveness endpoint and keeps a healthy/unhealthy flag.
///
/// The flag starts out unhealthy. One probe runs in [`HealthChecker::start`]
/// before it returns, then one every `interval` until the cancellation token
/// fires.
pub struct HealthChecker {
    target: UpstreamTarget,
    transport: Arc<dyn RoundTripper>,
    interval: Duration,
    timeout: Duration,
    state: RwLock<HealthState>,
    cancel: CancellationToken,
}

impl HealthChecker {
    pub fn new(
        target: UpstreamTarget,
        transport: Arc<dyn RoundTripper>,
        interval: Duration,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            target,
            transport,
            interval,
            timeout,
            state: RwLock::new(HealthState {
                is_healthy: false,
                last_transition: Utc::now(),
                unhealthy_transitions: 0,
            }),
            cancel,
        })
    }

    pub async fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.check().await;

        let checker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = checker.cancel.cancelled() => {
                        tracing::info!(upstream=%checker.target, "exit health check loop");
                        return;
                    }
                    _ = tokio::time::sleep(checker.interval) => {
                        checker.check().await;
                    }
                }
            }
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.read_state().is_healthy
    }

    pub fn state(&self) -> HealthState {
        self.read_state().clone()
    }

    /// Probe once and update the flag. Returns the new health.
    pub async fn check(&self) -> bool {
        match self.probe().await {
            Ok(()) => {
                self.mark_healthy();
                true
            }
            Err(reason) => {
                self.mark_unhealthy(&reason);
                false
            }
        }
    }

    async fn probe(&self) -> Result<(), String> {
        let url = self.target.url_for(LIVENESS_PATH).map_err(|e| e.to_string())?;
        let req = reqwest::Request::new(Method::GET, url);
        let exchange = async {
            let resp = self
                .transport
                .round_trip(req)
                .await
                .map_err(|e| e.to_string())?;
            let status = resp.status();
            let body = resp.bytes().await.map_err(|e| e.to_string())?;
            if !status.is_success() || body.as_ref() != LIVENESS_OK {
                return Err(format!(
                    "unexpected liveness answer {}: {}",
                    status.as_u16(),
                    String::from_utf8_lossy(&body)
                ));
            }
            Ok(())
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(format!("liveness probe timed out after {:?}", self.timeout)),
        }
    }

    fn mark_healthy(&self) {
        let mut state = self.write_state();
        if !state.is_healthy {
            tracing::info!(upstream=%self.target, "cluster becomes healthy");
        }
        state.is_healthy = true;
        state.last_transition = Utc::now();
    }

    fn mark_unhealthy(&self, reason: &str) {
        let mut state = self.write_state();
        if !state.is_healthy {
            tracing::debug!(upstream=%self.target, reason, "cluster is still unhealthy");
            return;
        }
        let now = Utc::now();
        let healthy_for = now - state.last_transition;
        state.is_healthy = false;
        state.last_transition = now;
        state.unhealthy_transitions += 1;
        tracing::warn!(
            upstream=%self.target,
            reason,
            healthy_secs = healthy_for.num_seconds(),
            "cluster becomes unhealthy"
        );
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, HealthState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, HealthState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}
