//! HTTP/1.1 framing.
//!
//! Parsing is stateless: each call re-examines the buffer from the start and
//! reports how many bytes one complete message occupies. Callers keep any
//! trailing bytes (pipelined requests) in their buffer for the next call.
//!
//! ```text
//! Request:  GET / HTTP/1.1\r\nHost: x\r\n\r\n
//! Response: HTTP/1.1 200 OK\r\n...\r\nContent-Length: 13\r\n\r\nHello, world!
//! ```

use crate::http::types::{keep_alive, Request, Response, Version};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Maximum number of headers in one message.
const MAX_HEADERS: usize = 128;

/// Longest chunk-size line accepted in a chunked body.
const MAX_CHUNK_LINE: usize = 1024;

/// HTTP/1.1 protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The request line is malformed.
    BadRequestLine,
    /// The status line is malformed.
    BadStatusLine,
    /// A header line is malformed.
    BadHeader,
    /// Header name contains invalid characters.
    InvalidHeaderName,
    /// Header value contains invalid characters.
    InvalidHeaderValue,
    /// Version other than HTTP/1.0 or HTTP/1.1.
    UnsupportedVersion,
    /// Content-Length header is not a valid integer.
    BadContentLength,
    /// Multiple Content-Length headers present.
    DuplicateContentLength,
    /// Both Content-Length and Transfer-Encoding present.
    AmbiguousBodyLength,
    /// Transfer-Encoding other than chunked.
    BadTransferEncoding,
    /// Malformed chunked body.
    BadChunkedEncoding,
    /// Head exceeds the configured limit.
    HeadersTooLarge,
    /// More than `MAX_HEADERS` headers.
    TooManyHeaders,
    /// Body exceeds the configured limit.
    BodyTooLarge,
    /// The stream ended in the middle of a message.
    PartialMessage,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequestLine => write!(f, "malformed request line"),
            Self::BadStatusLine => write!(f, "malformed status line"),
            Self::BadHeader => write!(f, "malformed header"),
            Self::InvalidHeaderName => write!(f, "invalid header name"),
            Self::InvalidHeaderValue => write!(f, "invalid header value"),
            Self::UnsupportedVersion => write!(f, "unsupported HTTP version"),
            Self::BadContentLength => write!(f, "invalid Content-Length"),
            Self::DuplicateContentLength => write!(f, "duplicate Content-Length"),
            Self::AmbiguousBodyLength => {
                write!(f, "both Content-Length and Transfer-Encoding present")
            }
            Self::BadTransferEncoding => write!(f, "unsupported Transfer-Encoding"),
            Self::BadChunkedEncoding => write!(f, "malformed chunked encoding"),
            Self::HeadersTooLarge => write!(f, "header block too large"),
            Self::TooManyHeaders => write!(f, "too many headers"),
            Self::BodyTooLarge => write!(f, "body exceeds size limit"),
            Self::PartialMessage => write!(f, "stream ended mid-message"),
        }
    }
}

impl std::error::Error for HttpError {}

/// Size limits applied while parsing.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_headers_size: usize,
    pub max_body_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_headers_size: 64 * 1024,
            max_body_size: 1024 * 1024,
        }
    }
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult<T> {
    /// A complete message and the number of bytes it occupied.
    Complete(T, usize),
    /// Need more data.
    Incomplete,
    /// Protocol error; the stream cannot be resynchronised.
    Error(HttpError),
}

/// How the body following a head is delimited.
enum BodyKind {
    Empty,
    Length(usize),
    Chunked,
    UntilEof,
}

/// Parse one request from the front of `input`.
///
/// Sessions reading from a socket use `RequestParser`, which avoids
/// rescanning a partial head on every read.
#[allow(dead_code)]
pub fn parse_request(input: &[u8], limits: &Limits) -> ParseResult<Request> {
    match find_head_end(input, 0, limits) {
        Ok(Some(head_end)) => parse_request_at(input, head_end, limits),
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse a request whose head ends at `head_end`.
fn parse_request_at(input: &[u8], head_end: usize, limits: &Limits) -> ParseResult<Request> {
    let head = match std::str::from_utf8(&input[..head_end - 4]) {
        Ok(head) => head,
        Err(_) => return ParseResult::Error(HttpError::BadHeader),
    };
    let (start, header_block) = head.split_once("\r\n").unwrap_or((head, ""));

    let (method, target, version) = match parse_request_line(start) {
        Ok(parts) => parts,
        Err(e) => return ParseResult::Error(e),
    };
    let headers = match parse_headers(header_block) {
        Ok(headers) => headers,
        Err(e) => return ParseResult::Error(e),
    };
    let kind = match body_kind(&headers, limits, false) {
        Ok(kind) => kind,
        Err(e) => return ParseResult::Error(e),
    };

    let (body, consumed) = match read_body(&input[head_end..], kind, limits, false) {
        Ok(Some((body, len))) => (body, head_end + len),
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };

    ParseResult::Complete(
        Request {
            method: method.to_string(),
            target: target.to_string(),
            version,
            headers,
            body,
        },
        consumed,
    )
}

/// Incremental request parser for one receive buffer.
///
/// Remembers how far the head search got, so a head arriving over many reads
/// is scanned once. Between calls the caller may only append to the buffer,
/// or drop exactly the bytes a `Complete` result consumed.
#[derive(Debug, Clone, Copy)]
pub struct RequestParser {
    limits: Limits,
    /// Buffer length already searched without finding the end of the head.
    searched: usize,
    head_end: Option<usize>,
}

impl RequestParser {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            searched: 0,
            head_end: None,
        }
    }

    pub fn parse(&mut self, input: &[u8]) -> ParseResult<Request> {
        let head_end = match self.head_end {
            Some(end) => end,
            None => match find_head_end(input, self.searched.saturating_sub(3), &self.limits) {
                Ok(Some(end)) => {
                    self.head_end = Some(end);
                    end
                }
                Ok(None) => {
                    self.searched = input.len();
                    return ParseResult::Incomplete;
                }
                Err(e) => return ParseResult::Error(e),
            },
        };

        let result = parse_request_at(input, head_end, &self.limits);
        if !matches!(result, ParseResult::Incomplete) {
            self.searched = 0;
            self.head_end = None;
        }
        result
    }
}

/// Parse one response from the front of `input`.
///
/// `eof` tells the parser the peer has finished sending, which completes a
/// body that has neither a length nor chunked framing.
pub fn parse_response(input: &[u8], eof: bool, limits: &Limits) -> ParseResult<Response> {
    let head_end = match find_head_end(input, 0, limits) {
        Ok(Some(end)) => end,
        Ok(None) if eof => return ParseResult::Error(HttpError::PartialMessage),
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };

    let head = match std::str::from_utf8(&input[..head_end - 4]) {
        Ok(head) => head,
        Err(_) => return ParseResult::Error(HttpError::BadHeader),
    };
    let (start, header_block) = head.split_once("\r\n").unwrap_or((head, ""));

    let (version, status, reason) = match parse_status_line(start) {
        Ok(parts) => parts,
        Err(e) => return ParseResult::Error(e),
    };
    let headers = match parse_headers(header_block) {
        Ok(headers) => headers,
        Err(e) => return ParseResult::Error(e),
    };
    let kind = if (100..200).contains(&status) || status == 204 || status == 304 {
        BodyKind::Empty
    } else {
        match body_kind(&headers, limits, true) {
            Ok(kind) => kind,
            Err(e) => return ParseResult::Error(e),
        }
    };

    let (body, consumed) = match read_body(&input[head_end..], kind, limits, eof) {
        Ok(Some((body, len))) => (body, head_end + len),
        Ok(None) if eof => return ParseResult::Error(HttpError::PartialMessage),
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };

    let keep_alive = keep_alive(version, &headers);
    ParseResult::Complete(
        Response {
            status,
            reason: reason.to_string(),
            version,
            headers,
            body,
            keep_alive,
        },
        consumed,
    )
}

/// Serialize a response, adding the `Connection` header implied by its
/// keep-alive flag and a `Content-Length` for the body.
pub fn encode_response(res: &Response, dst: &mut BytesMut) {
    dst.reserve(128 + res.body.len());
    dst.put_slice(res.version.as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(res.status.to_string().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(res.reason.as_bytes());
    dst.put_slice(b"\r\n");

    put_headers(&res.headers, dst);

    match (res.version, res.keep_alive) {
        (Version::Http11, false) => dst.put_slice(b"Connection: close\r\n"),
        (Version::Http10, true) => dst.put_slice(b"Connection: keep-alive\r\n"),
        _ => {}
    }

    put_body(&res.headers, &res.body, dst);
}

/// Serialize a request.
pub fn encode_request(req: &Request, dst: &mut BytesMut) {
    dst.reserve(128 + req.body.len());
    dst.put_slice(req.method.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(req.target.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(req.version.as_str().as_bytes());
    dst.put_slice(b"\r\n");

    put_headers(&req.headers, dst);

    if req.body.is_empty() && req.header("content-length").is_none() {
        dst.put_slice(b"\r\n");
    } else {
        put_body(&req.headers, &req.body, dst);
    }
}

fn put_headers(headers: &[(String, String)], dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.put_slice(name.as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
}

fn put_body(headers: &[(String, String)], body: &Bytes, dst: &mut BytesMut) {
    if !headers
        .iter()
        .any(|(n, _)| n.eq_ignore_ascii_case("content-length"))
    {
        dst.put_slice(b"Content-Length: ");
        dst.put_slice(body.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
    dst.put_slice(body);
}

/// Locate the end of the head (index just past `\r\n\r\n`), searching
/// from `from`.
fn find_head_end(input: &[u8], from: usize, limits: &Limits) -> Result<Option<usize>, HttpError> {
    let tail = input.get(from..).unwrap_or_default();
    match tail.windows(4).position(|w| w == b"\r\n\r\n").map(|i| from + i) {
        Some(pos) if pos + 4 > limits.max_headers_size => Err(HttpError::HeadersTooLarge),
        Some(pos) => Ok(Some(pos + 4)),
        None if input.len() > limits.max_headers_size => Err(HttpError::HeadersTooLarge),
        None => Ok(None),
    }
}

/// Parse the request line: `METHOD SP TARGET SP VERSION`.
fn parse_request_line(line: &str) -> Result<(&str, &str, Version), HttpError> {
    let mut parts = line.split(' ');
    let method = parts.next().ok_or(HttpError::BadRequestLine)?;
    let target = parts.next().ok_or(HttpError::BadRequestLine)?;
    let version = parts.next().ok_or(HttpError::BadRequestLine)?;
    if parts.next().is_some() || method.is_empty() || target.is_empty() {
        return Err(HttpError::BadRequestLine);
    }
    if !method.bytes().all(is_tchar) {
        return Err(HttpError::BadRequestLine);
    }
    if target.bytes().any(|b| b.is_ascii_control()) {
        return Err(HttpError::BadRequestLine);
    }

    Ok((method, target, parse_version(version, HttpError::BadRequestLine)?))
}

/// Parse the status line: `VERSION SP STATUS SP REASON`.
fn parse_status_line(line: &str) -> Result<(Version, u16, &str), HttpError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().ok_or(HttpError::BadStatusLine)?;
    let status = parts.next().ok_or(HttpError::BadStatusLine)?;
    let reason = parts.next().unwrap_or("");

    let version = parse_version(version, HttpError::BadStatusLine)?;
    if status.len() != 3 {
        return Err(HttpError::BadStatusLine);
    }
    let status = status.parse().map_err(|_| HttpError::BadStatusLine)?;
    Ok((version, status, reason))
}

fn parse_version(s: &str, malformed: HttpError) -> Result<Version, HttpError> {
    match Version::from_bytes(s.as_bytes()) {
        Some(v) => Ok(v),
        None if s.starts_with("HTTP/") => Err(HttpError::UnsupportedVersion),
        None => Err(malformed),
    }
}

fn parse_headers(block: &str) -> Result<Vec<(String, String)>, HttpError> {
    let mut headers = Vec::new();
    if block.is_empty() {
        return Ok(headers);
    }

    for line in block.split("\r\n") {
        if headers.len() == MAX_HEADERS {
            return Err(HttpError::TooManyHeaders);
        }
        let (name, value) = line.split_once(':').ok_or(HttpError::BadHeader)?;
        if name.is_empty() || !name.bytes().all(is_tchar) {
            return Err(HttpError::InvalidHeaderName);
        }
        let value = value.trim_matches(|c| c == ' ' || c == '\t');
        if value.bytes().any(|b| b.is_ascii_control() && b != b'\t') {
            return Err(HttpError::InvalidHeaderValue);
        }
        headers.push((name.to_string(), value.to_string()));
    }

    Ok(headers)
}

fn body_kind(
    headers: &[(String, String)],
    limits: &Limits,
    until_eof: bool,
) -> Result<BodyKind, HttpError> {
    let mut content_length = None;
    let mut transfer_encoding = None;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            if content_length.is_some() {
                return Err(HttpError::DuplicateContentLength);
            }
            let len: usize = value.parse().map_err(|_| HttpError::BadContentLength)?;
            content_length = Some(len);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding = Some(value.as_str());
        }
    }

    match (content_length, transfer_encoding) {
        (Some(_), Some(_)) => Err(HttpError::AmbiguousBodyLength),
        (None, Some(te)) => {
            let last = te.rsplit(',').next().unwrap_or("").trim();
            if last.eq_ignore_ascii_case("chunked") {
                Ok(BodyKind::Chunked)
            } else {
                Err(HttpError::BadTransferEncoding)
            }
        }
        (Some(len), None) if len > limits.max_body_size => Err(HttpError::BodyTooLarge),
        (Some(0), None) => Ok(BodyKind::Empty),
        (Some(len), None) => Ok(BodyKind::Length(len)),
        (None, None) if until_eof => Ok(BodyKind::UntilEof),
        (None, None) => Ok(BodyKind::Empty),
    }
}

/// Returns the body and the bytes it occupied, or `None` if incomplete.
fn read_body(
    input: &[u8],
    kind: BodyKind,
    limits: &Limits,
    eof: bool,
) -> Result<Option<(Bytes, usize)>, HttpError> {
    match kind {
        BodyKind::Empty => Ok(Some((Bytes::new(), 0))),
        BodyKind::Length(len) if input.len() >= len => {
            Ok(Some((Bytes::copy_from_slice(&input[..len]), len)))
        }
        BodyKind::Length(_) => Ok(None),
        BodyKind::Chunked => decode_chunked(input, limits),
        BodyKind::UntilEof if input.len() > limits.max_body_size => Err(HttpError::BodyTooLarge),
        BodyKind::UntilEof if eof => Ok(Some((Bytes::copy_from_slice(input), input.len()))),
        BodyKind::UntilEof => Ok(None),
    }
}

fn decode_chunked(input: &[u8], limits: &Limits) -> Result<Option<(Bytes, usize)>, HttpError> {
    let mut body = BytesMut::new();
    let mut pos = 0;

    loop {
        let line_end = match find_crlf(&input[pos..]) {
            Some(i) => pos + i,
            None if input.len() - pos > MAX_CHUNK_LINE => {
                return Err(HttpError::BadChunkedEncoding)
            }
            None => return Ok(None),
        };
        let line =
            std::str::from_utf8(&input[pos..line_end]).map_err(|_| HttpError::BadChunkedEncoding)?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size =
            usize::from_str_radix(size_str, 16).map_err(|_| HttpError::BadChunkedEncoding)?;
        pos = line_end + 2;

        if size == 0 {
            // Trailers are skipped up to the terminating empty line and count
            // against the head limit.
            let trailers_start = pos;
            loop {
                let end = match find_crlf(&input[pos..]) {
                    Some(i) => pos + i,
                    None if input.len() - trailers_start > limits.max_headers_size => {
                        return Err(HttpError::HeadersTooLarge)
                    }
                    None => return Ok(None),
                };
                if end + 2 - trailers_start > limits.max_headers_size {
                    return Err(HttpError::HeadersTooLarge);
                }
                let empty = end == pos;
                pos = end + 2;
                if empty {
                    return Ok(Some((body.freeze(), pos)));
                }
            }
        }

        if size > limits.max_body_size - body.len() {
            return Err(HttpError::BodyTooLarge);
        }
        if input.len() < pos + size + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&input[pos..pos + size]);
        if &input[pos + size..pos + size + 2] != b"\r\n" {
            return Err(HttpError::BadChunkedEncoding);
        }
        pos += size + 2;
    }
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
