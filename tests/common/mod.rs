//! Loopback helpers shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use url::Url;

/// How long `/slow` takes to answer.
pub const SLOW_RESPONSE_DELAY: std::time::Duration = std::time::Duration::from_millis(2500);

/// A tiny HTTP/1.1 backend.
///
/// `GET /health` answers with the configured health status, `/chunked`
/// answers with a chunked body, `/cookies` sets two cookies, `/slow` answers after
/// [`SLOW_RESPONSE_DELAY`], anything else with `200` and
/// `hello from <name>`. Every request head it sees is recorded.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub url: Url,
    requests: Arc<Mutex<Vec<String>>>,
    health_status: Arc<AtomicU16>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start(name: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let health_status = Arc::new(AtomicU16::new(200));

        let handle = tokio::spawn({
            let requests = Arc::clone(&requests);
            let health_status = Arc::clone(&health_status);
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let requests = Arc::clone(&requests);
                    let health_status = Arc::clone(&health_status);
                    tokio::spawn(async move {
                        serve_one(stream, name, requests, health_status).await;
                    });
                }
            }
        });

        Self {
            addr,
            url: Url::parse(&format!("http://{addr}")).unwrap(),
            requests,
            health_status,
            handle,
        }
    }

    pub fn set_health_status(&self, status: u16) {
        self.health_status.store(status, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests other than health probes.
    pub fn proxied_requests(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| !r.starts_with("GET /health "))
            .collect()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_one(
    mut stream: TcpStream,
    name: &'static str,
    requests: Arc<Mutex<Vec<String>>>,
    health_status: Arc<AtomicU16>,
) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    while buf.len() < head_end + 4 + content_length {
        match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
    let body = String::from_utf8_lossy(&buf[head_end + 4..]).into_owned();
    requests.lock().unwrap().push(format!("{head}\r\n\r\n{body}"));

    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
    let response = if path.ends_with("/health") {
        let status = health_status.load(Ordering::SeqCst);
        format!("HTTP/1.1 {status} Status\r\nContent-Length: 2\r\n\r\nok")
    } else if path.ends_with("/slow") {
        tokio::time::sleep(SLOW_RESPONSE_DELAY).await;
        let body = format!("slow hello from {name}");
        format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len())
    } else if path.ends_with("/cookies") {
        "HTTP/1.1 200 OK\r\nSet-Cookie: session=abc; Path=/\r\nSet-Cookie: theme=dark\r\nContent-Length: 0\r\n\r\n"
            .to_string()
    } else if path.ends_with("/chunked") {
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
            .to_string()
    } else {
        let body = format!("hello from {name}");
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Backend: {name}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
    };

    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// A URL nothing listens on.
pub fn closed_url() -> Url {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{addr}")).unwrap()
}

/// Sends raw bytes and reads until the peer closes.
/// Returns (status, head, body).
pub async fn send_raw(addr: SocketAddr, raw: &str) -> (u16, String, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response).into_owned();

    let (head, body) = response.split_once("\r\n\r\n").unwrap_or((&response, ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    (status, head.to_string(), body.to_string())
}
