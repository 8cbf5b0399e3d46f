//! Per-request failures and the JSON body they are reported with.

use serde::Serialize;
use thiserror::Error;

use crate::http::response::{Response, ResponseBuilder, StatusCode};

/// Failures that end a single request. None of them affect other requests,
/// and none is retried against another backend.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("rate limit exceeded for client {client:?}")]
    RateLimitExceeded { client: String },

    #[error("no backend available")]
    NoBackendAvailable,

    #[error("transport failure talking to {backend}: {source:#}")]
    Transport {
        backend: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub code: u16,
    pub message: &'a str,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::RateLimitExceeded { .. } => StatusCode::TooManyRequests,
            ProxyError::NoBackendAvailable | ProxyError::Transport { .. } => {
                StatusCode::ServiceUnavailable
            }
        }
    }

    /// Client-facing message; never leaks backend addresses.
    pub fn public_message(&self) -> &'static str {
        match self {
            ProxyError::RateLimitExceeded { .. } => "Rate limit exceeded",
            ProxyError::NoBackendAvailable => "No available backends",
            ProxyError::Transport { .. } => "Backend unavailable",
        }
    }

    pub fn into_response(self) -> Response {
        json_error(self.status(), self.public_message())
    }
}

/// Builds a `{"code": .., "message": ..}` response.
pub fn json_error(status: StatusCode, message: &str) -> Response {
    let body = ErrorBody {
        code: status.as_u16(),
        message,
    };
    let body = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());

    ResponseBuilder::new(status)
        .header("Content-Type", "application/json")
        .body(body)
        .build()
}
