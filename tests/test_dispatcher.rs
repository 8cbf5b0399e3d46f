//! Dispatcher pipeline against loopback backends

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{MockBackend, closed_url};
use roundgate::http::parser::parse_http_request;
use roundgate::http::request::{Method, Request, RequestBuilder};
use roundgate::http::response::StatusCode;
use roundgate::proxy::{BackendPool, Dispatcher, UpstreamClient};
use roundgate::ratelimit::{ClientLimit, RateLimiter};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

fn dispatcher(urls: Vec<Url>, limit: ClientLimit) -> Dispatcher {
    Dispatcher::new(
        Arc::new(BackendPool::new(urls)),
        Arc::new(RateLimiter::new(limit)),
        UpstreamClient::new(Duration::from_secs(1), Duration::from_secs(2)),
    )
}

fn get(path: &str) -> Request {
    RequestBuilder::new()
        .method(Method::GET)
        .path(path)
        .header("Host", "proxy.local")
        .build()
        .unwrap()
}

fn peer() -> Option<SocketAddr> {
    Some("127.0.0.1:40000".parse().unwrap())
}

fn json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_forwards_and_relays_backend_response() {
    let backend = MockBackend::start("alpha").await;
    let dispatcher = dispatcher(vec![backend.url.clone()], ClientLimit::new(10, 1));

    let response = dispatcher.dispatch(&get("/api/items?x=1"), peer()).await;

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.body, b"hello from alpha");
    assert_eq!(response.header("X-Backend"), Some("alpha"));

    let seen = backend.proxied_requests();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("GET /api/items?x=1 HTTP/1.1\r\n"));
    assert!(seen[0].contains(&format!("Host: {}\r\n", backend.addr)));
    assert!(seen[0].contains("X-Forwarded-For: 127.0.0.1\r\n"));
    assert!(!seen[0].contains("proxy.local"));
}

#[tokio::test]
async fn test_forwards_request_body() {
    let backend = MockBackend::start("alpha").await;
    let dispatcher = dispatcher(vec![backend.url.clone()], ClientLimit::new(10, 1));
    let request = RequestBuilder::new()
        .method(Method::POST)
        .path("/submit")
        .header("Content-Length", "7")
        .body(b"payload".to_vec())
        .build()
        .unwrap();

    let response = dispatcher.dispatch(&request, peer()).await;

    assert_eq!(response.status, StatusCode::Ok);
    let seen = backend.proxied_requests();
    assert!(seen[0].starts_with("POST /submit HTTP/1.1\r\n"));
    assert!(seen[0].ends_with("\r\n\r\npayload"));
}

#[tokio::test]
async fn test_rotates_between_backends() {
    let a = MockBackend::start("a").await;
    let b = MockBackend::start("b").await;
    let dispatcher = dispatcher(vec![a.url.clone(), b.url.clone()], ClientLimit::new(100, 1));

    let mut names = Vec::new();
    for _ in 0..4 {
        let response = dispatcher.dispatch(&get("/"), peer()).await;
        names.push(response.header("X-Backend").unwrap_or_default().to_string());
    }

    assert_eq!(names, ["a", "b", "a", "b"]);
}

#[tokio::test]
async fn test_rate_limited_client_gets_429_without_forwarding() {
    let backend = MockBackend::start("alpha").await;
    let dispatcher = dispatcher(vec![backend.url.clone()], ClientLimit::new(2, 0));

    for _ in 0..2 {
        let ok = dispatcher.dispatch(&get("/"), peer()).await;
        assert_eq!(ok.status, StatusCode::Ok);
    }
    let limited = dispatcher.dispatch(&get("/"), peer()).await;

    assert_eq!(limited.status, StatusCode::TooManyRequests);
    assert_eq!(limited.header("Content-Type"), Some("application/json"));
    let body = json(&limited.body);
    assert_eq!(body["code"], 429);
    assert_eq!(body["message"], "Rate limit exceeded");
    assert_eq!(backend.proxied_requests().len(), 2);
}

#[tokio::test]
async fn test_forwarded_client_has_own_bucket() {
    let backend = MockBackend::start("alpha").await;
    let dispatcher = dispatcher(vec![backend.url.clone()], ClientLimit::new(1, 0));

    let direct = dispatcher.dispatch(&get("/"), peer()).await;
    let forwarded = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .header("X-Real-IP", "198.51.100.4")
        .build()
        .unwrap();
    let via_proxy = dispatcher.dispatch(&forwarded, peer()).await;

    assert_eq!(direct.status, StatusCode::Ok);
    assert_eq!(via_proxy.status, StatusCode::Ok);
    assert_eq!(dispatcher.limiter().tokens("198.51.100.4"), Some(0));
    assert_eq!(dispatcher.limiter().tokens("127.0.0.1"), Some(0));
}

#[tokio::test]
async fn test_no_available_backend_is_503() {
    let backend = MockBackend::start("alpha").await;
    let dispatcher = dispatcher(vec![backend.url.clone()], ClientLimit::new(10, 1));
    dispatcher.pool().mark_unhealthy(&backend.url);

    let response = dispatcher.dispatch(&get("/"), peer()).await;

    assert_eq!(response.status, StatusCode::ServiceUnavailable);
    let body = json(&response.body);
    assert_eq!(body["code"], 503);
    assert_eq!(body["message"], "No available backends");
    assert!(backend.proxied_requests().is_empty());
}

#[tokio::test]
async fn test_rejected_request_still_spends_a_token() {
    let backend = MockBackend::start("alpha").await;
    let dispatcher = dispatcher(vec![backend.url.clone()], ClientLimit::new(3, 0));
    dispatcher.pool().mark_unhealthy(&backend.url);

    dispatcher.dispatch(&get("/"), peer()).await;

    assert_eq!(dispatcher.limiter().tokens("127.0.0.1"), Some(2));
}

#[tokio::test]
async fn test_transport_failure_marks_only_that_backend_down() {
    let dead = closed_url();
    let live = MockBackend::start("live").await;
    let dispatcher = dispatcher(vec![dead.clone(), live.url.clone()], ClientLimit::new(10, 1));

    let failed = dispatcher.dispatch(&get("/"), peer()).await;

    assert_eq!(failed.status, StatusCode::ServiceUnavailable);
    let body = json(&failed.body);
    assert_eq!(body["message"], "Backend unavailable");
    assert!(!String::from_utf8_lossy(&failed.body).contains(&dead.to_string()));

    let pool = dispatcher.pool();
    assert!(!pool.get(0).unwrap().is_alive());
    assert!(pool.get(1).unwrap().is_alive());

    // No retry for the failed request, but the next one skips the dead backend.
    let next = dispatcher.dispatch(&get("/"), peer()).await;
    assert_eq!(next.status, StatusCode::Ok);
    assert_eq!(live.proxied_requests().len(), 1);
}

#[tokio::test]
async fn test_chunked_backend_response_is_reframed() {
    let backend = MockBackend::start("alpha").await;
    let dispatcher = dispatcher(vec![backend.url.clone()], ClientLimit::new(10, 1));

    let response = dispatcher.dispatch(&get("/chunked"), peer()).await;

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.body, b"hello world");
    assert_eq!(response.header("Content-Length"), Some("11"));
    assert_eq!(response.header("Transfer-Encoding"), None);
}

#[tokio::test]
async fn test_repeated_response_headers_reach_client() {
    let backend = MockBackend::start("alpha").await;
    let dispatcher = dispatcher(vec![backend.url.clone()], ClientLimit::new(10, 1));

    let response = dispatcher.dispatch(&get("/cookies"), peer()).await;

    let cookies: Vec<&str> = response.header_values("Set-Cookie").collect();
    assert_eq!(cookies, ["session=abc; Path=/", "theme=dark"]);
}

#[tokio::test]
async fn test_extension_method_is_forwarded_verbatim() {
    let backend = MockBackend::start("alpha").await;
    let dispatcher = dispatcher(vec![backend.url.clone()], ClientLimit::new(10, 1));
    let (request, _) = parse_http_request(b"PROPFIND /dav/ HTTP/1.1\r\nDepth: 1\r\n\r\n").unwrap();

    let response = dispatcher.dispatch(&request, peer()).await;

    assert_eq!(response.status, StatusCode::Ok);
    let seen = backend.proxied_requests();
    assert!(seen[0].starts_with("PROPFIND /dav/ HTTP/1.1\r\n"));
    assert!(seen[0].contains("Depth: 1\r\n"));
}

#[tokio::test]
async fn test_unframeable_backend_response_is_503_and_marks_down() {
    // Answers every request with a chunk size no body could fit.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
    let server = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nab\r\n0\r\n\r\n")
                .await;
        }
    });
    let dispatcher = dispatcher(vec![url], ClientLimit::new(10, 1));

    let response = dispatcher.dispatch(&get("/"), peer()).await;

    assert_eq!(response.status, StatusCode::ServiceUnavailable);
    assert_eq!(json(&response.body)["message"], "Backend unavailable");
    assert!(!dispatcher.pool().get(0).unwrap().is_alive());

    server.abort();
}
