//! Per-request pipeline: identify, rate limit, select, forward.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::ProxyError;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::proxy::backend::BackendPool;
use crate::proxy::client_id;
use crate::proxy::selector::{BackendSelector, RoundRobin};
use crate::proxy::upstream::UpstreamClient;
use crate::ratelimit::RateLimiter;

/// Owns the shared pool and limiter; one instance serves every connection.
pub struct Dispatcher {
    pool: Arc<BackendPool>,
    limiter: Arc<RateLimiter>,
    selector: Box<dyn BackendSelector>,
    upstream: UpstreamClient,
}

impl Dispatcher {
    pub fn new(pool: Arc<BackendPool>, limiter: Arc<RateLimiter>, upstream: UpstreamClient) -> Self {
        Self::with_selector(pool, limiter, upstream, Box::new(RoundRobin))
    }

    pub fn with_selector(
        pool: Arc<BackendPool>,
        limiter: Arc<RateLimiter>,
        upstream: UpstreamClient,
        selector: Box<dyn BackendSelector>,
    ) -> Self {
        Self {
            pool,
            limiter,
            selector,
            upstream,
        }
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Produces exactly one response for `request`: the backend's, or a
    /// JSON error (429 / 503).
    pub async fn dispatch(&self, request: &Request, peer: Option<SocketAddr>) -> Response {
        match self.try_dispatch(request, peer).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    ProxyError::RateLimitExceeded { client } => {
                        tracing::warn!(client = %client, "Rate limit exceeded")
                    }
                    ProxyError::NoBackendAvailable => {
                        tracing::warn!(path = %request.path, "No available backends")
                    }
                    ProxyError::Transport { backend, source } => {
                        tracing::error!(backend = %backend, error = %format!("{source:#}"), "Proxy error")
                    }
                }
                e.into_response()
            }
        }
    }

    async fn try_dispatch(&self, request: &Request, peer: Option<SocketAddr>) -> Result<Response, ProxyError> {
        let client = client_id::identify(request, peer);

        if !self.limiter.allow(&client) {
            return Err(ProxyError::RateLimitExceeded { client });
        }

        let backend = self
            .selector
            .select_next(&self.pool)
            .ok_or(ProxyError::NoBackendAvailable)?;

        tracing::info!(
            client = %client,
            backend = %backend.url,
            method = request.method.as_str(),
            path = %request.path,
            "Forwarding request"
        );

        match self.upstream.send(&backend.url, request, Some(&client)).await {
            Ok(response) => Ok(response),
            Err(source) => {
                self.pool.mark_unhealthy(&backend.url);
                Err(ProxyError::Transport {
                    backend: backend.url.to_string(),
                    source,
                })
            }
        }
    }
}
