//! Backend server management
//!
//! The pool is fixed at construction. Each backend carries a single atomic
//! liveness flag, and the pool owns the shared round-robin cursor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use url::Url;

/// One upstream server.
#[derive(Debug)]
pub struct Backend {
    /// Base URL, e.g. `http://localhost:9001`
    pub url: Url,
    alive: AtomicBool,
}

impl Backend {
    /// Backends start alive and stay so until a probe or a forwarding
    /// failure says otherwise.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            alive: AtomicBool::new(true),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Stores the new flag and returns the previous one.
    pub fn set_alive(&self, alive: bool) -> bool {
        self.alive.swap(alive, Ordering::AcqRel)
    }

    /// `host[:port]` as it should appear in a `Host` header.
    pub fn host_header(&self) -> String {
        host_header(&self.url)
    }
}

pub(crate) fn host_header(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}

/// Ordered, fixed set of backends plus the rotation cursor.
#[derive(Debug, Default)]
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    cursor: AtomicUsize,
}

impl BackendPool {
    pub fn new(urls: Vec<Url>) -> Self {
        let backends = urls
            .into_iter()
            .map(|url| {
                tracing::info!(backend = %url, "Backend registered");
                Arc::new(Backend::new(url))
            })
            .collect();

        Self {
            backends,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Parses each address, skipping (and logging) the ones that are not URLs.
    pub fn from_addresses<S: AsRef<str>>(addresses: &[S]) -> Self {
        let urls = addresses
            .iter()
            .filter_map(|raw| match Url::parse(raw.as_ref()) {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::warn!(backend = raw.as_ref(), error = %e, "Invalid backend URL");
                    None
                }
            })
            .collect();
        Self::new(urls)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Backend>> {
        self.backends.get(index)
    }

    /// Advances the shared cursor by one and returns the value it held.
    /// Wraps on overflow; callers reduce it modulo the pool size.
    pub fn advance_cursor(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// Failure feedback: marks the backend with this address as down.
    /// Unknown addresses are ignored.
    pub fn mark_unhealthy(&self, address: &Url) {
        if let Some(backend) = self.backends.iter().find(|b| &b.url == address) {
            if backend.set_alive(false) {
                tracing::warn!(backend = %address, "Backend marked as unhealthy");
            }
        }
    }

    pub fn available_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }
}
