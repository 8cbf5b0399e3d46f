use std::time::Instant;

/// Capacity and refill speed for one client's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLimit {
    pub capacity: u32,
    /// Tokens added per second
    pub refill_rate: u32,
}

impl ClientLimit {
    pub fn new(capacity: u32, refill_rate: u32) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }
}

impl From<crate::config::RateLimitConfig> for ClientLimit {
    fn from(cfg: crate::config::RateLimitConfig) -> Self {
        Self::new(cfg.capacity, cfg.refill_rate)
    }
}

/// Token bucket for a single client. Not synchronised; the registry wraps
/// each one in its own lock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: u32,
    refill_rate: u32,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(limit: ClientLimit, now: Instant) -> Self {
        Self {
            capacity: limit.capacity,
            tokens: limit.capacity,
            refill_rate: limit.refill_rate,
            last_refill: now,
            last_seen: now,
        }
    }

    /// Adds whole tokens earned since the last refill.
    ///
    /// `last_refill` only moves when at least one token is added, so a
    /// fractional remainder keeps accumulating across calls.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let to_add = (elapsed * f64::from(self.refill_rate)).floor();

        if to_add >= 1.0 {
            // Saturating float-to-int cast; anything past capacity is clamped below.
            let to_add = to_add as u64;
            let refilled = (u64::from(self.tokens) + to_add).min(u64::from(self.capacity));
            self.tokens = refilled as u32;
            self.last_refill = now;
        }
    }

    /// Refills, records activity, and takes one token if there is one.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.last_seen = now;

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> u32 {
        self.refill_rate
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}
