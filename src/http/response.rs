/// HTTP status codes the proxy produces itself, plus a pass-through variant
/// for whatever a backend answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 204 No Content
    NoContent,
    /// 400 Bad Request
    BadRequest,
    /// 404 Not Found
    NotFound,
    /// 429 Too Many Requests
    TooManyRequests,
    /// 500 Internal Server Error
    InternalServerError,
    /// 502 Bad Gateway
    BadGateway,
    /// 503 Service Unavailable
    ServiceUnavailable,
    /// 504 Gateway Timeout
    GatewayTimeout,
    /// Any other code, relayed unchanged from a backend
    Other(u16),
}

impl StatusCode {
    /// Maps a numeric code onto a named variant when one exists.
    ///
    /// ```
    /// # use roundgate::http::response::StatusCode;
    /// assert_eq!(StatusCode::from_u16(429), StatusCode::TooManyRequests);
    /// assert_eq!(StatusCode::from_u16(418), StatusCode::Other(418));
    /// ```
    pub fn from_u16(code: u16) -> Self {
        match code {
            200 => StatusCode::Ok,
            204 => StatusCode::NoContent,
            400 => StatusCode::BadRequest,
            404 => StatusCode::NotFound,
            429 => StatusCode::TooManyRequests,
            500 => StatusCode::InternalServerError,
            502 => StatusCode::BadGateway,
            503 => StatusCode::ServiceUnavailable,
            504 => StatusCode::GatewayTimeout,
            other => StatusCode::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::NoContent => 204,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::TooManyRequests => 429,
            StatusCode::InternalServerError => 500,
            StatusCode::BadGateway => 502,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::GatewayTimeout => 504,
            StatusCode::Other(code) => *code,
        }
    }

    /// Standard reason phrase; empty for codes relayed through `Other`,
    /// which HTTP/1.1 permits.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::NoContent => "No Content",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::TooManyRequests => "Too Many Requests",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::BadGateway => "Bad Gateway",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::GatewayTimeout => "Gateway Timeout",
            StatusCode::Other(_) => "",
        }
    }

    /// True for any 2xx code.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.as_u16())
    }
}

/// A complete response, either generated locally or relayed from a backend.
///
/// Header lines keep their order and repeats, so a backend's multiple
/// `Set-Cookie` lines all reach the client.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Fluent builder for [`Response`].
///
/// ```ignore
/// let response = ResponseBuilder::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(b"{}".to_vec())
///     .build();
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Sets a header, replacing any earlier lines of that name (any casing).
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&key));
        self.headers.push((key, value.into()));
        self
    }

    /// Appends header lines as given, repeats included.
    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Builds the response, adding `Content-Length` from the body unless a
    /// header of that name (any casing) is already present.
    pub fn build(mut self) -> Response {
        let has_length = self
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("Content-Length"));
        if !has_length {
            self.headers
                .push(("Content-Length".to_string(), self.body.len().to_string()));
        }

        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl Response {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        ResponseBuilder::new(StatusCode::Ok)
            .body(body.into())
            .build()
    }

    pub fn bad_request() -> Self {
        ResponseBuilder::new(StatusCode::BadRequest)
            .header("Content-Type", "text/plain")
            .header("Connection", "close")
            .body(b"400 Bad Request".to_vec())
            .build()
    }

    /// Case-insensitive header lookup; the first line wins.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.header_values(key).next()
    }

    pub fn header_values<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}
