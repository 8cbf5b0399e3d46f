//! Per-client token-bucket registry.
//!
//! Two levels of locking:
//! - the client → bucket map sits behind an `RwLock`; the admission path
//!   only takes the shared side, the write side is taken to insert a new
//!   client or to sweep idle ones;
//! - every bucket has its own `Mutex`, so checks for one client are
//!   linearizable without serialising unrelated clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::ratelimit::bucket::{ClientLimit, TokenBucket};

type SharedBucket = Arc<Mutex<TokenBucket>>;

#[derive(Debug)]
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, SharedBucket>>,
    client_limits: RwLock<HashMap<String, ClientLimit>>,
    default_limit: RwLock<ClientLimit>,
}

impl RateLimiter {
    pub fn new(default_limit: ClientLimit) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            client_limits: RwLock::new(HashMap::new()),
            default_limit: RwLock::new(default_limit),
        }
    }

    /// Registers or replaces an override for `client_id`.
    ///
    /// Only buckets created after this call see it; an existing bucket keeps
    /// its size until it is evicted.
    pub fn set_client_limit(&self, client_id: impl Into<String>, limit: ClientLimit) {
        self.client_limits.write().insert(client_id.into(), limit);
    }

    /// Changes the default for buckets created from now on.
    pub fn set_default_limit(&self, limit: ClientLimit) {
        *self.default_limit.write() = limit;
    }

    pub fn default_limit(&self) -> ClientLimit {
        *self.default_limit.read()
    }

    /// Takes one token from `client_id`'s bucket, creating the bucket on
    /// first sight. Returns `false` when the bucket is empty.
    pub fn allow(&self, client_id: &str) -> bool {
        self.allow_at(client_id, Instant::now())
    }

    /// [`allow`](Self::allow) with an explicit clock reading.
    pub fn allow_at(&self, client_id: &str, now: Instant) -> bool {
        let bucket = self.bucket(client_id, now);
        bucket.lock().try_acquire(now)
    }

    fn bucket(&self, client_id: &str, now: Instant) -> SharedBucket {
        if let Some(bucket) = self.buckets.read().get(client_id) {
            return Arc::clone(bucket);
        }

        let limit = self.limit_for(client_id);
        let mut buckets = self.buckets.write();
        // Another request may have inserted it between the two locks.
        let bucket = buckets
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(limit, now))));
        Arc::clone(bucket)
    }

    fn limit_for(&self, client_id: &str) -> ClientLimit {
        self.client_limits
            .read()
            .get(client_id)
            .copied()
            .unwrap_or_else(|| self.default_limit())
    }

    /// Drops every bucket idle for longer than `ttl`. Returns how many went.
    pub fn cleanup(&self, ttl: Duration) -> usize {
        self.cleanup_at(ttl, Instant::now())
    }

    /// [`cleanup`](Self::cleanup) with an explicit clock reading.
    ///
    /// Holds the map's write lock for the whole sweep.
    pub fn cleanup_at(&self, ttl: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets.write();
        let before = buckets.len();

        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.lock().last_seen()) <= ttl);

        before - buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Tokens currently left for `client_id`, if it has a bucket.
    pub fn tokens(&self, client_id: &str) -> Option<u32> {
        self.buckets
            .read()
            .get(client_id)
            .map(|bucket| bucket.lock().tokens())
    }

    /// Sweeps every `interval` until `shutdown` is cancelled.
    pub async fn run_cleanup(self: Arc<Self>, interval: Duration, ttl: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.cleanup(ttl);
                    tracing::debug!(
                        removed,
                        remaining = self.bucket_count(),
                        "Rate limiter cleanup"
                    );
                }
            }
        }

        tracing::debug!("Rate limiter cleanup stopped");
    }
}
