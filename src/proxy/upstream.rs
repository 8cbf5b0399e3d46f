//! Upstream connection and request forwarding
//!
//! One request per backend connection (`Connection: close`). Any failure
//! here is a transport failure from the dispatcher's point of view.

use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::proxy::backend::host_header;
use crate::proxy::client_id::FORWARDED_FOR_HEADER;
use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

const BUFFER_SIZE: usize = 8192;
const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_LINE_SIZE: usize = 8 * 1024;
/// Largest response body accepted from a backend, however it is framed.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Stripped in both directions; the proxy manages its own connections.
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Sends `request` to the backend at `backend_url` and reads the whole
    /// response.
    ///
    /// `client`, when given, is appended to `X-Forwarded-For`.
    pub async fn send(&self, backend_url: &Url, request: &Request, client: Option<&str>) -> Result<Response> {
        let host = backend_url
            .host_str()
            .context("Backend URL missing host")?
            .trim_start_matches('[')
            .trim_end_matches(']');
        let port = backend_url
            .port_or_known_default()
            .context("Backend URL missing port")?;

        let mut stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .context("Connection timeout")?
            .with_context(|| format!("Failed to connect to {host}:{port}"))?;

        tracing::trace!(backend = %backend_url, "Connected to backend");

        let request_bytes = build_http_request(request, backend_url, client);
        let head_only = request.method == Method::HEAD;

        timeout(self.request_timeout, async {
            stream.write_all(&request_bytes).await?;
            stream.flush().await?;
            read_http_response(&mut stream, head_only).await
        })
        .await
        .context("Request timeout")?
    }
}

/// Builds the bytes sent to the backend.
///
/// The path is joined onto the backend's base path and `Host` is rewritten
/// to the backend. Hop-by-hop headers are dropped and `Connection: close`
/// is set.
pub fn build_http_request(request: &Request, backend_url: &Url, client: Option<&str>) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(512 + request.body.len());

    let path = join_path(backend_url, &request.path);
    buffer.extend_from_slice(
        format!("{} {} {}\r\n", request.method.as_str(), path, request.version).as_bytes(),
    );

    let mut forwarded_for: Vec<&str> = Vec::new();
    let mut had_length = false;

    for (key, value) in &request.headers {
        if is_hop_by_hop(key) || key.eq_ignore_ascii_case("Host") {
            continue;
        }
        if key.eq_ignore_ascii_case("Content-Length") {
            had_length = true;
            continue;
        }
        if key.eq_ignore_ascii_case(FORWARDED_FOR_HEADER) {
            forwarded_for.push(value);
            continue;
        }
        push_header(&mut buffer, key, value);
    }

    push_header(&mut buffer, "Host", &host_header(backend_url));

    // Repeated X-Forwarded-For lines fold into one list, client last.
    forwarded_for.extend(client.filter(|c| !c.is_empty()));
    if !forwarded_for.is_empty() {
        push_header(&mut buffer, FORWARDED_FOR_HEADER, &forwarded_for.join(", "));
    }

    if had_length || !request.body.is_empty() {
        push_header(&mut buffer, "Content-Length", &request.body.len().to_string());
    }

    push_header(&mut buffer, "Connection", "close");
    buffer.extend_from_slice(b"\r\n");
    buffer.extend_from_slice(&request.body);

    buffer
}

/// Joins a request target onto the backend URL's base path.
///
/// ```
/// # use roundgate::proxy::upstream::join_path;
/// let base = url::Url::parse("http://localhost:9001/api/").unwrap();
/// assert_eq!(join_path(&base, "/users?id=1"), "/api/users?id=1");
/// ```
pub fn join_path(base: &Url, target: &str) -> String {
    let prefix = base.path().trim_end_matches('/');
    match target {
        "" => format!("{prefix}/"),
        t if t.starts_with('/') => format!("{prefix}{t}"),
        t => format!("{prefix}/{t}"),
    }
}

fn push_header(buffer: &mut Vec<u8>, key: &str, value: &str) {
    buffer.extend_from_slice(key.as_bytes());
    buffer.extend_from_slice(b": ");
    buffer.extend_from_slice(value.as_bytes());
    buffer.extend_from_slice(b"\r\n");
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Reads one response off `stream`.
///
/// Bodies are framed by `Content-Length`, by chunked encoding (decoded here
/// and re-framed with a length), or by the backend closing the connection.
/// `head_only` marks the answer to a `HEAD` request, which has no body.
pub async fn read_http_response<S>(stream: &mut S, head_only: bool) -> Result<Response>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    let head_end = loop {
        if let Some(end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break end;
        }
        if buffer.len() > MAX_HEAD_SIZE {
            anyhow::bail!("Response headers too large");
        }
        buffer.reserve(BUFFER_SIZE);
        if stream.read_buf(&mut buffer).await? == 0 {
            anyhow::bail!("Connection closed before complete response received");
        }
    };

    let head = buffer.split_to(head_end + 4);
    let (status, mut headers) = parse_response_head(&head)?;

    let chunked = header_value(&headers, "Transfer-Encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
    let content_length = header_value(&headers, "Content-Length")
        .map(|v| v.trim().parse::<usize>().context("Invalid Content-Length"))
        .transpose()?;
    if let Some(length) = content_length.filter(|&l| l > MAX_BODY_SIZE) {
        anyhow::bail!("Response body of {length} bytes exceeds limit");
    }

    let bodyless = head_only
        || status.as_u16() < 200
        || status == StatusCode::NoContent
        || status.as_u16() == 304;

    let body = if bodyless {
        Vec::new()
    } else if chunked {
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case("Content-Length"));
        read_chunked_body(stream, &mut buffer).await?
    } else if let Some(length) = content_length {
        fill(stream, &mut buffer, length).await?;
        buffer.split_to(length).to_vec()
    } else {
        read_to_close(stream, &mut buffer).await?
    };

    headers.retain(|(k, _)| !is_hop_by_hop(k));

    Ok(ResponseBuilder::new(status).headers(headers).body(body).build())
}

/// Parses the status line and header block of a response.
pub fn parse_response_head(head: &[u8]) -> Result<(StatusCode, Vec<(String, String)>)> {
    let head = std::str::from_utf8(head).context("Invalid UTF-8 in response headers")?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().context("Empty response")?;
    let mut parts = status_line.splitn(3, ' ');

    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        anyhow::bail!("Invalid status line: {status_line}");
    }

    let code: u16 = parts
        .next()
        .context("Missing status code")?
        .parse()
        .context("Invalid status code")?;
    if !(100..=999).contains(&code) {
        anyhow::bail!("Status code out of range: {code}");
    }

    let mut headers = Vec::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok((StatusCode::from_u16(code), headers))
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

async fn fill<S>(stream: &mut S, buffer: &mut BytesMut, wanted: usize) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    while buffer.len() < wanted {
        buffer.reserve((wanted - buffer.len()).min(BUFFER_SIZE));
        if stream.read_buf(buffer).await? == 0 {
            anyhow::bail!("Connection closed before complete body received");
        }
    }
    Ok(())
}

async fn read_to_close<S>(stream: &mut S, buffer: &mut BytesMut) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if buffer.len() > MAX_BODY_SIZE {
            anyhow::bail!("Response body exceeds {MAX_BODY_SIZE} bytes");
        }
        buffer.reserve(BUFFER_SIZE);
        if stream.read_buf(buffer).await? == 0 {
            return Ok(buffer.split().to_vec());
        }
    }
}

async fn read_line<S>(stream: &mut S, buffer: &mut BytesMut) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buffer.windows(2).position(|w| w == b"\r\n") {
            let line = buffer.split_to(pos + 2);
            return Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        if buffer.len() > MAX_LINE_SIZE {
            anyhow::bail!("Chunk line too long");
        }
        buffer.reserve(BUFFER_SIZE);
        if stream.read_buf(buffer).await? == 0 {
            anyhow::bail!("Connection closed inside chunked body");
        }
    }
}

async fn read_chunked_body<S>(stream: &mut S, buffer: &mut BytesMut) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();

    loop {
        let line = read_line(stream, buffer).await?;
        let size_str = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_str, 16)
            .with_context(|| format!("Invalid chunk size {size_str:?}"))?;
        if size > MAX_BODY_SIZE - body.len() {
            anyhow::bail!("Chunked body exceeds {MAX_BODY_SIZE} bytes");
        }

        if size == 0 {
            // Trailers are read and discarded.
            while !read_line(stream, buffer).await?.is_empty() {}
            return Ok(body);
        }

        fill(stream, buffer, size + 2).await?;
        body.extend_from_slice(&buffer[..size]);
        if &buffer[size..size + 2] != b"\r\n" {
            anyhow::bail!("Malformed chunk terminator");
        }
        buffer.advance(size + 2);
    }
}
