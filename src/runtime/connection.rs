//! Session state machine shared by both scheduler backends.
//!
//! Each accepted connection is owned by exactly one session, which moves
//! through `Reading -> Processing -> Writing -> Reading ...` until the peer
//! goes away, then `Closing -> Done`. Reading and writing never overlap.

use crate::config::Config;
use crate::http::Limits;

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for a complete request in the receive buffer.
    Reading,
    /// Building the response for the decoded request.
    Processing,
    /// Flushing the encoded response.
    Writing,
    /// Half-closing the send side.
    Closing,
    /// Terminal; the connection is released.
    Done,
}

impl ConnState {
    /// Next state after a read attempt.
    ///
    /// A clean end of stream and a failed read both close the session.
    pub fn after_read(got_request: bool) -> Self {
        if got_request {
            ConnState::Processing
        } else {
            ConnState::Closing
        }
    }

    /// Next state after a write attempt.
    ///
    /// Only a successful write of a keep-alive response loops back to reading.
    pub fn after_write(written: bool, keep_alive: bool) -> Self {
        if written && keep_alive {
            ConnState::Reading
        } else {
            ConnState::Closing
        }
    }
}

/// Per-session settings derived from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Bytes reserved in the receive buffer when it runs out of room.
    pub buffer_size: usize,
    /// Codec limits.
    pub limits: Limits,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024,
            limits: Limits::default(),
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            buffer_size: config.buffer_size,
            limits: Limits {
                max_headers_size: config.max_headers_size,
                max_body_size: config.max_body_size,
            },
        }
    }
}
