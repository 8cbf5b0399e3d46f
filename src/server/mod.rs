//! Server assembly and lifecycle.
//!
//! [`Server`] owns the backend pool, the rate limiter and the dispatcher,
//! plus the two background loops (health probing and limiter cleanup).
//! All of them stop when the shutdown token passed to [`Server::run`] is
//! cancelled.

pub mod listener;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::proxy::{BackendPool, Dispatcher, HealthMonitor, UpstreamClient};
use crate::ratelimit::{ClientLimit, RateLimiter};

/// How long in-flight connections get to finish after shutdown starts.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Server {
    config: Config,
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    /// Builds the shared state and binds the listening socket.
    pub async fn bind(config: Config) -> anyhow::Result<Self> {
        let pool = Arc::new(BackendPool::from_addresses(&config.backends));
        if pool.is_empty() {
            anyhow::bail!("no usable backends configured");
        }

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.into()));
        for (client, limit) in &config.client_limits {
            limiter.set_client_limit(client.clone(), ClientLimit::from(*limit));
        }

        let upstream = UpstreamClient::new(
            config.upstream.connect_timeout(),
            config.upstream.request_timeout(),
        );
        let dispatcher = Arc::new(Dispatcher::new(pool, limiter, upstream));

        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        tracing::info!(
            backends = dispatcher.pool().len(),
            capacity = config.rate_limit.capacity,
            refill_rate = config.rate_limit.refill_rate,
            "Proxy server initialized"
        );

        Ok(Self {
            config,
            listener,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Serves until `shutdown` is cancelled, then drains connections (up to
    /// [`SHUTDOWN_GRACE`]) and joins the background loops.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        // Cancelled only after the drain, so probing continues meanwhile.
        let background = CancellationToken::new();
        let tracker = TaskTracker::new();

        let monitor = HealthMonitor::new(
            Arc::clone(self.dispatcher.pool()),
            self.config.health_check.interval(),
            self.config.health_check.timeout(),
        );
        let health_task = tokio::spawn(monitor.run(background.clone()));

        let cleanup_task = tokio::spawn(Arc::clone(self.dispatcher.limiter()).run_cleanup(
            self.config.cleanup.interval(),
            self.config.cleanup.ttl(),
            background.clone(),
        ));

        let served = listener::run(
            self.listener,
            Arc::clone(&self.dispatcher),
            tracker.clone(),
            shutdown.clone(),
        )
        .await;

        tracing::info!("Shutting down proxy server...");
        tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
            tracing::warn!(
                remaining = tracker.len(),
                "Graceful shutdown timed out"
            );
        }

        background.cancel();
        let (health, cleanup) = tokio::join!(health_task, cleanup_task);
        health.context("health monitor task panicked")?;
        cleanup.context("cleanup task panicked")?;

        tracing::info!("Shutdown complete");
        served
    }
}
