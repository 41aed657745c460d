//! HTTP/1.1 protocol support.
//!
//! - `types`: request/response values and keep-alive semantics
//! - `codec`: framing (parse from a byte buffer, encode into one)
//! - `handler`: the fixed application response
//!
//! The codec is synchronous and works on raw byte buffers, so both the
//! tokio sessions and the mio event loop drive the same code.

pub mod codec;
pub mod handler;
pub mod types;

pub use codec::Limits;
pub use types::{Request, Response, Version};
