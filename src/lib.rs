//! Roundgate - rate-limited round-robin reverse proxy
//!
//! Core library: HTTP/1.1 handling, backend pool with health probing,
//! per-client token-bucket rate limiting and the request dispatcher.

pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod ratelimit;
pub mod server;
