//! Application handler.
//!
//! Every request gets the same page; the method, target and headers are not
//! examined. Only the version and keep-alive preference carry over.

use crate::http::types::{Request, Response};
use bytes::Bytes;

/// Value of the `Server` header.
pub const SERVER_NAME: &str = concat!("coop-httpd/", env!("CARGO_PKG_VERSION"));

/// Response body served for every request.
pub const BODY: &str = "Hello, world!";

/// Build the response for a decoded request.
pub fn respond(req: &Request) -> Response {
    let mut res = Response::new(200, req.version);
    res.headers.push(("Server".to_string(), SERVER_NAME.to_string()));
    res.headers.push(("Content-Type".to_string(), "text/html".to_string()));
    res.keep_alive = req.keep_alive();
    res.body = Bytes::from_static(BODY.as_bytes());
    res
}
