//! Derives the rate-limiting key for a request.

use std::net::SocketAddr;

use crate::http::request::Request;

pub const REAL_IP_HEADER: &str = "X-Real-IP";
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

/// Identifies the caller of `request`.
///
/// Precedence: a non-empty `X-Real-IP`, then the first entry of
/// a non-empty `X-Forwarded-For`, then the peer's IP. The result is trimmed and may be
/// empty, in which case every such caller shares one bucket.
pub fn identify(request: &Request, peer: Option<SocketAddr>) -> String {
    if let Some(ip) = request.header(REAL_IP_HEADER).filter(|v| !v.trim().is_empty()) {
        return ip.trim().to_string();
    }

    if let Some(forwarded) = request.header(FORWARDED_FOR_HEADER).filter(|v| !v.is_empty()) {
        let first = forwarded.split(',').next().unwrap_or_default();
        return first.trim().to_string();
    }

    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}
