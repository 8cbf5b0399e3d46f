use crate::http::request::{Method, Request};

/// Upper bound on the request line plus headers.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidHeader,
    InvalidContentLength,
    /// Chunked request bodies are not accepted
    UnsupportedTransferEncoding,
    HeadTooLarge,
    Incomplete,
}

/// Parses one request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied, so pipelined
/// bytes after it stay in the caller's buffer.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let head_end = match find_head_end(buf) {
        Some(end) => end,
        None if buf.len() > MAX_HEAD_SIZE => return Err(ParseError::HeadTooLarge),
        None => return Err(ParseError::Incomplete),
    };

    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| ParseError::InvalidRequest)?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;

    if !version.starts_with("HTTP/1.") {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ParseError::InvalidHeader);
        }
        headers.push((key.to_string(), value.trim().to_string()));
    }

    let lines_seen = &headers;
    let values = move |name: &'static str| {
        lines_seen
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    if values("Transfer-Encoding").any(|te| !te.eq_ignore_ascii_case("identity")) {
        return Err(ParseError::UnsupportedTransferEncoding);
    }

    // Repeated Content-Length lines must agree.
    let mut content_length = None;
    for raw in values("Content-Length") {
        let length = raw.parse::<usize>().map_err(|_| ParseError::InvalidContentLength)?;
        if content_length.is_some_and(|seen| seen != length) {
            return Err(ParseError::InvalidContentLength);
        }
        content_length = Some(length);
    }
    let content_length = content_length.unwrap_or(0);

    let body_start = head_end + 4;
    if buf.len() - body_start < content_length {
        return Err(ParseError::Incomplete);
    }

    let request = Request {
        method,
        path: path.to_string(),
        version: version.to_string(),
        headers,
        body: buf[body_start..body_start + content_length].to_vec(),
    };

    Ok((request, body_start + content_length))
}

/// Offset of the `\r\n\r\n` terminating the head, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
