//! Backend selection strategies.

use std::sync::Arc;

use crate::proxy::backend::{Backend, BackendPool};

/// Chooses the backend for the next request.
///
/// Implementations must be non-blocking: they run on the request path for
/// every request.
pub trait BackendSelector: Send + Sync {
    fn select_next(&self, pool: &BackendPool) -> Option<Arc<Backend>>;
}

/// Round-robin over alive backends using the pool's shared cursor.
///
/// Each attempt consumes one cursor step and at most `len` attempts are
/// made, so every backend is looked at no more than once per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobin;

impl BackendSelector for RoundRobin {
    fn select_next(&self, pool: &BackendPool) -> Option<Arc<Backend>> {
        let total = pool.len();

        for _ in 0..total {
            let index = pool.advance_cursor() % total;
            let candidate = &pool.backends()[index];

            if candidate.is_alive() {
                tracing::debug!(backend = %candidate.url, "Backend selected");
                return Some(Arc::clone(candidate));
            }
        }

        None
    }
}
