//! HTTP/1.x message types.

use bytes::Bytes;
use std::fmt;

/// Protocol version carried on the request/status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn from_bytes(b: &[u8]) -> Option<Version> {
        match b {
            b"HTTP/1.0" => Some(Version::Http10),
            b"HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
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

/// A decoded HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: &str, target: &str, version: Version) -> Self {
        Self {
            method: method.to_string(),
            target: target.to_string(),
            version,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// First value of the named header (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Whether the client asked to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }
}

/// An HTTP response, either built by the handler or decoded by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub version: Version,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Drives the `Connection` header on encode; derived from headers on decode.
    pub keep_alive: bool,
}

impl Response {
    pub fn new(status: u16, version: Version) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            version,
            headers: Vec::new(),
            body: Bytes::new(),
            keep_alive: version == Version::Http11,
        }
    }

    /// First value of the named header (case-insensitive).
    #[cfg(test)]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {} {}", self.version, self.status, self.reason)?;
        for (name, value) in &self.headers {
            writeln!(f, "{name}: {value}")?;
        }
        writeln!(f)?;
        f.write_str(&String::from_utf8_lossy(&self.body))
    }
}

pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Persistent-connection rule: HTTP/1.1 stays open unless `Connection: close`,
/// HTTP/1.0 closes unless `Connection: keep-alive`.
pub(crate) fn keep_alive(version: Version, headers: &[(String, String)]) -> bool {
    let mut close = false;
    let mut keep = false;
    for (name, value) in headers {
        if !name.eq_ignore_ascii_case("connection") {
            continue;
        }
        for token in value.split(',').map(str::trim) {
            if token.eq_ignore_ascii_case("close") {
                close = true;
            } else if token.eq_ignore_ascii_case("keep-alive") {
                keep = true;
            }
        }
    }

    match version {
        Version::Http11 => !close,
        Version::Http10 => keep && !close,
    }
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_http11() {
        let req = Request::new("GET", "/", Version::Http11);
        assert!(req.keep_alive());

        let req = req.with_header("Connection", "close");
        assert!(!req.keep_alive());
    }

    #[test]
    fn test_keep_alive_http10() {
        let req = Request::new("GET", "/", Version::Http10);
        assert!(!req.keep_alive());

        let req = req.with_header("connection", "Keep-Alive");
        assert!(req.keep_alive());
    }

    #[test]
    fn test_connection_token_list() {
        let req = Request::new("GET", "/", Version::Http11).with_header("Connection", "Upgrade, close");
        assert!(!req.keep_alive());
    }

    #[test]
    fn test_header_lookup() {
        let req = Request::new("GET", "/", Version::Http11).with_header("Host", "x");
        assert_eq!(req.header("host"), Some("x"));
        assert_eq!(req.header("accept"), None);
    }
}
