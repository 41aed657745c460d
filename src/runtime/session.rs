//! Per-connection task for the tokio backend.
//!
//! A `Session` owns its stream exclusively and is spawned detached by the
//! listener. Failures never leave the session: every outcome ends in the
//! `Closing` state, which half-closes the connection.

use crate::http::codec::{self, HttpError, ParseResult, RequestParser};
use crate::http::handler;
use crate::http::{Request, Response};
use crate::runtime::connection::{ConnState, SessionSettings};
use bytes::{Buf, BytesMut};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// Result of waiting for the next request.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete request was decoded.
    Request(Request),
    /// The peer closed its send side between requests.
    StreamEnded,
}

/// Errors that end a single session.
#[derive(Debug)]
pub enum SessionError {
    Decode(HttpError),
    Io(io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Decode(e) => write!(f, "decode error: {e}"),
            SessionError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Decode(e) => Some(e),
            SessionError::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}

pub struct Session<S> {
    stream: S,
    state: ConnState,
    /// Receive buffer, kept across requests so pipelined bytes survive.
    buffer: BytesMut,
    parser: RequestParser,
    /// Encoded response awaiting write.
    out: BytesMut,
    request: Option<Request>,
    response: Option<Response>,
    settings: SessionSettings,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, settings: SessionSettings) -> Self {
        Self {
            stream,
            state: ConnState::Reading,
            buffer: BytesMut::with_capacity(settings.buffer_size),
            parser: RequestParser::new(settings.limits),
            out: BytesMut::new(),
            request: None,
            response: None,
            settings,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Drive the connection to completion.
    pub async fn run(mut self) {
        while self.state != ConnState::Done {
            self.step().await;
        }
    }

    /// Execute the current state and move to the next one.
    pub async fn step(&mut self) {
        self.state = match self.state {
            ConnState::Reading => match self.read_request().await {
                Ok(ReadOutcome::Request(req)) => {
                    trace!(method = %req.method, target = %req.target, "Request decoded");
                    self.request = Some(req);
                    ConnState::after_read(true)
                }
                Ok(ReadOutcome::StreamEnded) => {
                    debug!("Stream ended");
                    ConnState::after_read(false)
                }
                Err(SessionError::Decode(e)) => {
                    warn!(error = %e, "Failed to decode request");
                    ConnState::after_read(false)
                }
                Err(e) => {
                    debug!(error = %e, "Read failed");
                    ConnState::after_read(false)
                }
            },
            ConnState::Processing => match self.request.as_ref() {
                Some(req) => {
                    self.response = Some(handler::respond(req));
                    ConnState::Writing
                }
                None => ConnState::Closing,
            },
            ConnState::Writing => {
                let keep_alive = self.response.as_ref().is_some_and(|res| res.keep_alive);
                match self.write_response().await {
                    Ok(()) => ConnState::after_write(true, keep_alive),
                    Err(e) => {
                        debug!(error = %e, "Write failed");
                        ConnState::after_write(false, keep_alive)
                    }
                }
            }
            ConnState::Closing => {
                self.shutdown().await;
                ConnState::Done
            }
            ConnState::Done => ConnState::Done,
        };
    }

    /// Wait until the receive buffer holds a complete request.
    async fn read_request(&mut self) -> Result<ReadOutcome, SessionError> {
        loop {
            match self.parser.parse(&self.buffer) {
                ParseResult::Complete(req, consumed) => {
                    self.buffer.advance(consumed);
                    return Ok(ReadOutcome::Request(req));
                }
                ParseResult::Error(e) => return Err(SessionError::Decode(e)),
                ParseResult::Incomplete => {}
            }

            if self.buffer.len() == self.buffer.capacity() {
                self.buffer.reserve(self.settings.buffer_size);
            }

            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return if self.buffer.is_empty() {
                    Ok(ReadOutcome::StreamEnded)
                } else {
                    Err(SessionError::Decode(HttpError::PartialMessage))
                };
            }
        }
    }

    async fn write_response(&mut self) -> io::Result<()> {
        let Some(res) = self.response.as_ref() else {
            return Ok(());
        };

        self.out.clear();
        codec::encode_response(res, &mut self.out);
        self.stream.write_all(&self.out).await?;
        self.stream.flush().await
    }

    /// Stop sending; the receive side stays open.
    async fn shutdown(&mut self) {
        match self.stream.shutdown().await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => warn!(error = %e, "Failed to shut down connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler::SERVER_NAME;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio_test::io::Builder;

    fn hello(connection: Option<&str>) -> Vec<u8> {
        let connection = connection
            .map(|c| format!("Connection: {c}\r\n"))
            .unwrap_or_default();
        format!(
            "HTTP/1.1 200 OK\r\nServer: {SERVER_NAME}\r\nContent-Type: text/html\r\n{connection}Content-Length: 13\r\n\r\nHello, world!"
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_keep_alive_serves_two_requests() {
        let stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .write(&hello(None))
            .read(b"GET /again HTTP/1.1\r\nHost: x\r\n\r\n")
            .write(&hello(None))
            .build();

        Session::new(stream, SessionSettings::default()).run().await;
    }

    #[tokio::test]
    async fn test_zero_buffer_size_still_serves() {
        let stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .write(&hello(None))
            .build();

        let settings = SessionSettings {
            buffer_size: 0,
            ..SessionSettings::default()
        };
        Session::new(stream, settings).run().await;
    }

    #[tokio::test]
    async fn test_connection_close_is_mirrored() {
        let stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .write(&hello(Some("close")))
            .build();

        let mut session = Session::new(stream, SessionSettings::default());
        session.step().await;
        assert_eq!(session.state(), ConnState::Processing);
        session.step().await;
        assert_eq!(session.state(), ConnState::Writing);
        session.step().await;
        assert_eq!(session.state(), ConnState::Closing);
        session.step().await;
        assert_eq!(session.state(), ConnState::Done);
    }

    #[tokio::test]
    async fn test_pipelined_requests_split_across_reads() {
        let stream = Builder::new()
            .read(b"GET /a HTTP/1.1\r\n\r\nGET /b HT")
            .write(&hello(None))
            .read(b"TP/1.1\r\n\r\n")
            .write(&hello(None))
            .build();

        Session::new(stream, SessionSettings::default()).run().await;
    }

    #[tokio::test]
    async fn test_malformed_request_gets_no_response() {
        let stream = Builder::new().read(b"NOT HTTP AT ALL\r\n\r\n").build();

        let mut session = Session::new(stream, SessionSettings::default());
        session.step().await;
        assert_eq!(session.state(), ConnState::Closing);
        session.run().await;
    }

    #[tokio::test]
    async fn test_read_error_closes_session() {
        let stream = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let mut session = Session::new(stream, SessionSettings::default());
        session.step().await;
        assert_eq!(session.state(), ConnState::Closing);
    }

    #[tokio::test]
    async fn test_write_error_closes_session() {
        let stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\n\r\n")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken"))
            .build();

        let mut session = Session::new(stream, SessionSettings::default());
        session.step().await;
        session.step().await;
        session.step().await;
        assert_eq!(session.state(), ConnState::Closing);
    }

    #[tokio::test]
    async fn test_partial_message_at_eof_is_decode_error() {
        let stream = Builder::new().read(b"GET / HTTP/1.1\r\nHo").build();

        let mut session = Session::new(stream, SessionSettings::default());
        match session.read_request().await {
            Err(SessionError::Decode(HttpError::PartialMessage)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clean_close_half_closes() {
        let (mut client, server) = duplex(4096);
        let session = tokio::spawn(Session::new(server, SessionSettings::default()).run());

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let expected = hello(None);
        let mut response = vec![0u8; expected.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, expected);

        // Closing our send side ends the stream cleanly; the session answers
        // by shutting down its own send side, which reads as EOF here.
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_ended_outcome() {
        let stream = Builder::new().build();
        let mut session = Session::new(stream, SessionSettings::default());
        assert!(matches!(
            session.read_request().await,
            Ok(ReadOutcome::StreamEnded)
        ));
    }
}
