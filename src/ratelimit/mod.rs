//! Per-client token-bucket rate limiting.

pub mod bucket;
pub mod limiter;

pub use bucket::{ClientLimit, TokenBucket};
pub use limiter::RateLimiter;
