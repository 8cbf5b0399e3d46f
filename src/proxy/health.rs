//! Periodic backend health probing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::http::request::{Method, RequestBuilder};
use crate::proxy::backend::{Backend, BackendPool};
use crate::proxy::upstream::UpstreamClient;

pub const HEALTH_PATH: &str = "/health";

pub struct HealthMonitor {
    pool: Arc<BackendPool>,
    client: UpstreamClient,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(pool: Arc<BackendPool>, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            pool,
            client: UpstreamClient::new(probe_timeout, probe_timeout),
            interval,
            probe_timeout,
        }
    }

    /// Probes every backend once per interval until `shutdown` is cancelled.
    /// The first round runs immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.check_all() => {}
            }
        }

        tracing::debug!("Health monitor stopped");
    }

    /// One probe round. Every backend is probed on its own task, so a slow
    /// backend never delays the verdict on another.
    pub async fn check_all(&self) {
        let mut probes = JoinSet::new();

        for backend in self.pool.backends() {
            let backend = Arc::clone(backend);
            let client = self.client.clone();
            let probe_timeout = self.probe_timeout;

            probes.spawn(async move {
                let outcome = probe(&client, &backend, probe_timeout).await;
                record(&backend, outcome);
            });
        }

        while let Some(res) = probes.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "Health probe task failed");
            }
        }
    }
}

/// `GET <base>/health` within `probe_timeout`; healthy on any 2xx.
pub async fn probe(client: &UpstreamClient, backend: &Backend, probe_timeout: Duration) -> Result<(), String> {
    let request = RequestBuilder::new()
        .method(Method::GET)
        .path(HEALTH_PATH)
        .header("User-Agent", concat!("roundgate/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(str::to_string)?;

    match tokio::time::timeout(probe_timeout, client.send(&backend.url, &request, None)).await {
        Ok(Ok(response)) if response.status.is_success() => Ok(()),
        Ok(Ok(response)) => Err(format!("status {}", response.status.as_u16())),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(_) => Err(format!("timed out after {probe_timeout:?}")),
    }
}

fn record(backend: &Backend, result: Result<(), String>) {
    let was_alive = backend.set_alive(result.is_ok());

    match (was_alive, result) {
        (false, Ok(())) => tracing::info!(backend = %backend.url, "Backend recovered"),
        (true, Ok(())) => tracing::debug!(backend = %backend.url, "Health check passed"),
        (true, Err(reason)) => {
            tracing::warn!(backend = %backend.url, reason = %reason, "Health check failed, backend marked down")
        }
        (false, Err(reason)) => {
            tracing::debug!(backend = %backend.url, reason = %reason, "Health check still failing")
        }
    }
}
