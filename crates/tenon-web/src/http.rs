//! HTTP/1.x message types, incremental request parsing and response encoding

use std::fmt;
use std::str::FromStr;

/// Request method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// HEAD
    Head,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// PATCH
    Patch,
    /// OPTIONS
    Options,
    /// Any other token
    Other(String),
}

impl Method {
    /// Method name as sent on the wire
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Other(s) => s,
        }
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(is_token_byte) {
            return Err(ProtocolError::BadRequestLine(format!("invalid method {:?}", s)));
        }
        Ok(match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "PATCH" => Method::Patch,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1
    Http11,
}

impl Version {
    /// Version as sent on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol faults detected while reading a request
///
/// Each maps to the status code of the error response sent before the
/// connection is closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Request line is not `METHOD target HTTP/x.y`
    #[error("malformed request line: {0}")]
    BadRequestLine(String),

    /// Header line cannot be parsed
    #[error("malformed header: {0}")]
    BadHeader(String),

    /// Version other than HTTP/1.0 or HTTP/1.1
    #[error("unsupported HTTP version {0}")]
    UnsupportedVersion(String),

    /// Request line and headers exceed the configured limit
    #[error("header section exceeds {limit} bytes")]
    HeaderTooLarge {
        /// Configured limit
        limit: usize,
    },

    /// Declared body exceeds the configured limit
    #[error("body of {length} bytes exceeds {limit} bytes")]
    BodyTooLarge {
        /// Declared length
        length: u64,
        /// Configured limit
        limit: usize,
    },

    /// Content-Length missing digits or conflicting
    #[error("invalid content-length: {0}")]
    BadContentLength(String),

    /// Transfer-Encoding on a request body
    #[error("unsupported transfer-encoding: {0}")]
    UnsupportedTransferEncoding(String),
}

impl ProtocolError {
    /// Status code of the error response
    pub fn status(&self) -> u16 {
        match self {
            ProtocolError::BadRequestLine(_)
            | ProtocolError::BadHeader(_)
            | ProtocolError::BadContentLength(_) => 400,
            ProtocolError::UnsupportedVersion(_) => 505,
            ProtocolError::HeaderTooLarge { .. } => 431,
            ProtocolError::BodyTooLarge { .. } => 413,
            ProtocolError::UnsupportedTransferEncoding(_) => 501,
        }
    }
}

/// Ordered header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header list
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of `name`, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether `name` is present
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a header, keeping existing values
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all values of `name`
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Remove every value of `name`
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Whether a comma-separated header such as `Connection` lists `token`
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Iterate headers in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of header lines
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Method
    pub method: Method,
    /// Request target as sent (path and query)
    pub target: String,
    /// Protocol version
    pub version: Version,
    /// Headers
    pub headers: Headers,
}

impl RequestHead {
    /// Length of the body that follows the head
    ///
    /// Only `Content-Length` framing is supported; any `Transfer-Encoding`
    /// is a protocol fault.
    pub fn body_length(&self, max_body_size: usize) -> Result<usize, ProtocolError> {
        if let Some(encoding) = self.headers.get("transfer-encoding") {
            return Err(ProtocolError::UnsupportedTransferEncoding(encoding.to_string()));
        }

        let mut length: Option<u64> = None;
        for value in self.headers.get_all("content-length") {
            let value = value.trim();
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ProtocolError::BadContentLength(value.to_string()));
            }
            let parsed: u64 = value
                .parse()
                .map_err(|_| ProtocolError::BadContentLength(value.to_string()))?;
            match length {
                Some(previous) if previous != parsed => {
                    return Err(ProtocolError::BadContentLength(format!(
                        "conflicting values {} and {}",
                        previous, parsed
                    )))
                }
                _ => length = Some(parsed),
            }
        }

        let length = length.unwrap_or(0);
        if length > max_body_size as u64 {
            return Err(ProtocolError::BodyTooLarge {
                length,
                limit: max_body_size,
            });
        }
        Ok(length as usize)
    }
}

/// A complete request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Method
    pub method: Method,
    /// Request target as sent (path and query)
    pub target: String,
    /// Protocol version
    pub version: Version,
    /// Headers
    pub headers: Headers,
    /// Body bytes
    pub body: Vec<u8>,
}

impl Request {
    /// Assemble a request from its head and body
    pub fn from_head(head: RequestHead, body: Vec<u8>) -> Self {
        Self {
            method: head.method,
            target: head.target,
            version: head.version,
            headers: head.headers,
            body,
        }
    }

    /// Target without the query string
    pub fn path(&self) -> &str {
        match self.target.find('?') {
            Some(idx) => &self.target[..idx],
            None => &self.target,
        }
    }

    /// Query string, if any
    pub fn query(&self) -> Option<&str> {
        self.target.find('?').map(|idx| &self.target[idx + 1..])
    }

    /// First value of a header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Body as UTF-8, lossily
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A response to be encoded onto the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status code
    pub status: u16,
    /// Headers; `Content-Length` and `Connection` are filled in on encode
    pub headers: Headers,
    /// Body bytes
    pub body: Vec<u8>,
}

impl Response {
    /// Empty response with a status
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// `text/plain` response
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.into().into_bytes())
    }

    /// 200 OK with a plain-text body
    pub fn ok(body: impl Into<String>) -> Self {
        Self::text(200, body)
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replace the body
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Reason phrase for a status code
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Try to parse a request head from the start of `buf`
///
/// Returns `Ok(None)` when more bytes are needed, or the head and the
/// number of bytes it occupied (including blank lines skipped before the
/// request line). Skipped blank lines count against `max_header_size`.
pub fn parse_head(
    buf: &[u8],
    max_header_size: usize,
) -> Result<Option<(RequestHead, usize)>, ProtocolError> {
    let whole = buf.len();

    // Empty lines before the request line are ignored
    let mut skipped = 0;
    while buf[skipped..].starts_with(b"\r\n") {
        skipped += 2;
    }
    let buf = &buf[skipped..];

    let Some(end) = find_head_end(buf) else {
        if whole > max_header_size {
            return Err(ProtocolError::HeaderTooLarge {
                limit: max_header_size,
            });
        }
        return Ok(None);
    };
    if end + 4 > max_header_size {
        return Err(ProtocolError::HeaderTooLarge {
            limit: max_header_size,
        });
    }

    let text = std::str::from_utf8(&buf[..end])
        .map_err(|_| ProtocolError::BadRequestLine("request head is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::BadRequestLine(request_line.to_string()));
    };

    let method: Method = method.parse()?;
    if target.is_empty() || target.bytes().any(|b| b.is_ascii_control()) {
        return Err(ProtocolError::BadRequestLine(request_line.to_string()));
    }
    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        v if v.starts_with("HTTP/") => return Err(ProtocolError::UnsupportedVersion(v.to_string())),
        _ => return Err(ProtocolError::BadRequestLine(request_line.to_string())),
    };

    let mut headers = Headers::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ProtocolError::BadHeader("obsolete line folding".into()));
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProtocolError::BadHeader(line.to_string()));
        };
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(ProtocolError::BadHeader(line.to_string()));
        }
        headers.append(name, value.trim());
    }

    Ok(Some((
        RequestHead {
            method,
            target: target.to_string(),
            version,
            headers,
        },
        skipped + end + 4,
    )))
}

/// Serialize a response
///
/// Fills in `Content-Length` when absent and a `Connection` header that
/// matches `keep_alive`. With `include_body` false (HEAD requests) the
/// body is omitted but its length is still advertised.
pub fn encode_response(
    response: &Response,
    version: Version,
    keep_alive: bool,
    include_body: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + response.body.len());
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            version,
            response.status,
            reason_phrase(response.status)
        )
        .as_bytes(),
    );

    for (name, value) in response.headers.iter() {
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if !response.headers.contains("content-length") {
        out.extend_from_slice(format!("Content-Length: {}\r\n", response.body.len()).as_bytes());
    }
    match (keep_alive, version) {
        (false, _) => out.extend_from_slice(b"Connection: close\r\n"),
        (true, Version::Http10) => out.extend_from_slice(b"Connection: keep-alive\r\n"),
        (true, Version::Http11) => {}
    }
    out.extend_from_slice(b"\r\n");

    if include_body {
        out.extend_from_slice(&response.body);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 8 * 1024;

    #[test]
    fn test_parse_complete_head() {
        let raw = b"GET /items?id=7 HTTP/1.1\r\nHost: example\r\nX-Trace: a\r\n\r\nrest";
        let (head, used) = parse_head(raw, LIMIT).unwrap().unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.target, "/items?id=7");
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.headers.get("host"), Some("example"));
        assert_eq!(head.headers.get("x-trace"), Some("a"));
        assert_eq!(&raw[used..], b"rest");
    }

    #[test]
    fn test_parse_needs_more() {
        assert_eq!(parse_head(b"GET / HTTP/1.1\r\nHost: x\r\n", LIMIT), Ok(None));
        assert_eq!(parse_head(b"", LIMIT), Ok(None));
    }

    #[test]
    fn test_parse_skips_leading_blank_lines() {
        let raw = b"\r\n\r\nGET / HTTP/1.0\r\n\r\n";
        let (head, used) = parse_head(raw, LIMIT).unwrap().unwrap();
        assert_eq!(head.version, Version::Http10);
        assert_eq!(used, raw.len());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_head(b"NOT A REQUEST LINE\r\n\r\n", LIMIT).unwrap_err();
        assert_eq!(err.status(), 400);

        let err = parse_head(b"GET /\r\n\r\n", LIMIT).unwrap_err();
        assert!(matches!(err, ProtocolError::BadRequestLine(_)));

        let err = parse_head(b"GET / HTTP/1.1\r\nno colon here\r\n\r\n", LIMIT).unwrap_err();
        assert!(matches!(err, ProtocolError::BadHeader(_)));
    }

    #[test]
    fn test_parse_unsupported_version() {
        let err = parse_head(b"GET / HTTP/2.0\r\n\r\n", LIMIT).unwrap_err();
        assert_eq!(err.status(), 505);
    }

    #[test]
    fn test_parse_header_too_large() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(100));
        let err = parse_head(&raw, 64).unwrap_err();
        assert_eq!(err, ProtocolError::HeaderTooLarge { limit: 64 });
        assert_eq!(err.status(), 431);
    }

    #[test]
    fn test_blank_lines_count_against_header_limit() {
        assert_eq!(parse_head(&b"\r\n".repeat(32), 64), Ok(None));

        let err = parse_head(&b"\r\n".repeat(40), 64).unwrap_err();
        assert_eq!(err, ProtocolError::HeaderTooLarge { limit: 64 });
    }

    #[test]
    fn test_body_length_rules() {
        let head = |extra: &str| {
            let raw = format!("POST /x HTTP/1.1\r\n{}\r\n", extra);
            parse_head(raw.as_bytes(), LIMIT).unwrap().unwrap().0
        };

        assert_eq!(head("").body_length(100), Ok(0));
        assert_eq!(head("Content-Length: 5\r\n").body_length(100), Ok(5));
        assert_eq!(
            head("Content-Length: 5\r\nContent-Length: 5\r\n").body_length(100),
            Ok(5)
        );
        assert!(matches!(
            head("Content-Length: 5\r\nContent-Length: 6\r\n").body_length(100),
            Err(ProtocolError::BadContentLength(_))
        ));
        assert!(matches!(
            head("Content-Length: -1\r\n").body_length(100),
            Err(ProtocolError::BadContentLength(_))
        ));
        assert_eq!(
            head("Content-Length: 500\r\n").body_length(100).unwrap_err().status(),
            413
        );
        assert_eq!(
            head("Transfer-Encoding: chunked\r\n")
                .body_length(100)
                .unwrap_err()
                .status(),
            501
        );
    }

    #[test]
    fn test_header_tokens() {
        let mut headers = Headers::new();
        headers.append("Connection", "Upgrade, Keep-Alive");
        assert!(headers.has_token("connection", "keep-alive"));
        assert!(!headers.has_token("connection", "close"));

        headers.set("CONNECTION", "close");
        assert_eq!(headers.len(), 1);
        assert!(headers.has_token("Connection", "close"));
    }

    #[test]
    fn test_request_path_and_query() {
        let (head, _) = parse_head(b"GET /a/b?x=1&y=2 HTTP/1.1\r\n\r\n", LIMIT)
            .unwrap()
            .unwrap();
        let request = Request::from_head(head, Vec::new());
        assert_eq!(request.path(), "/a/b");
        assert_eq!(request.query(), Some("x=1&y=2"));
    }

    #[test]
    fn test_encode_keep_alive_response() {
        let bytes = encode_response(&Response::ok("hi"), Version::Http11, true, true);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("Connection:"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn test_encode_close_and_head() {
        let response = Response::ok("hidden").with_header("Connection", "keep-alive");
        let text = String::from_utf8(encode_response(&response, Version::Http11, false, false))
            .unwrap();
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("keep-alive"));
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_encode_http10_keep_alive() {
        let text = String::from_utf8(encode_response(
            &Response::new(204),
            Version::Http10,
            true,
            true,
        ))
        .unwrap();
        assert!(text.starts_with("HTTP/1.0 204 No Content\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
    }
}
