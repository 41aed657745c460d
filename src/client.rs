//! One-shot blocking HTTP client.
//!
//! Fetches `/` from a host, prints nothing itself and returns the decoded
//! response. Used by `--get`; independent of the server runtime.

use crate::http::codec::{self, HttpError, Limits, ParseResult};
use crate::http::handler::SERVER_NAME;
use crate::http::{Request, Response, Version};
use bytes::BytesMut;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

const READ_CHUNK: usize = 4096;

/// Client errors
#[derive(Debug)]
pub enum ClientError {
    Resolve(String, io::Error),
    Connect(String, io::Error),
    Io(io::Error),
    Decode(HttpError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Resolve(target, e) => write!(f, "Failed to resolve '{}': {}", target, e),
            ClientError::Connect(target, e) => write!(f, "Failed to connect to '{}': {}", target, e),
            ClientError::Io(e) => write!(f, "I/O error: {}", e),
            ClientError::Decode(e) => write!(f, "Invalid response: {}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

/// Split `HOST:PORT`, accepting bracketed IPv6 hosts.
pub fn split_target(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// GET `/` from `host:port` and return the response.
pub fn http_get(host: &str, port: u16) -> Result<Response, ClientError> {
    let target = format!("{host}:{port}");
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| ClientError::Resolve(target.clone(), e))?
        .collect();

    let mut stream =
        TcpStream::connect(&addrs[..]).map_err(|e| ClientError::Connect(target.clone(), e))?;

    let req = Request::new("GET", "/", Version::Http11)
        .with_header("Host", host)
        .with_header("User-Agent", SERVER_NAME);
    let mut out = BytesMut::new();
    codec::encode_request(&req, &mut out);
    stream.write_all(&out)?;

    let res = read_response(&mut stream)?;

    match stream.shutdown(Shutdown::Both) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
        Err(e) => return Err(ClientError::Io(e)),
    }

    Ok(res)
}

fn read_response(stream: &mut impl Read) -> Result<Response, ClientError> {
    let limits = Limits::default();
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut eof = false;

    loop {
        match codec::parse_response(&buffer, eof, &limits) {
            ParseResult::Complete(res, _) => return Ok(res),
            ParseResult::Error(e) => return Err(ClientError::Decode(e)),
            ParseResult::Incomplete => {}
        }

        let n = stream.read(&mut chunk)?;
        if n == 0 {
            eof = true;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}
