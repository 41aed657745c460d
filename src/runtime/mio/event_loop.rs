//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Every session is registered for both directions once, edge-triggered.
//! On each event the session is stepped until its current operation would
//! block, so a wakeup is always pending for whatever it waits on.

use crate::http::codec::{self, HttpError, ParseResult, RequestParser};
use crate::http::{handler, Request};
use crate::runtime::connection::{ConnState, SessionSettings};
use crate::runtime::listener::{bind_listener, Endpoint};
use crate::runtime::ServerError;
use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Upper bound on how long a termination signal can go unnoticed.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

const EVENTS_CAPACITY: usize = 1024;

/// Per-connection session state for the mio backend.
struct MioSession {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
    /// Receive buffer, kept across requests so pipelined bytes survive.
    buffer: BytesMut,
    parser: RequestParser,
    /// Encoded response and how much of it has been written.
    out: BytesMut,
    written: usize,
    keep_alive: bool,
    request: Option<Request>,
}

impl MioSession {
    fn new(stream: TcpStream, peer: SocketAddr, settings: &SessionSettings) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            buffer: BytesMut::with_capacity(settings.buffer_size),
            parser: RequestParser::new(settings.limits),
            out: BytesMut::new(),
            written: 0,
            keep_alive: false,
            request: None,
        }
    }

    /// Step the state machine until it blocks or finishes.
    ///
    /// Returns `true` once the session reached `Done`.
    fn drive(&mut self, settings: &SessionSettings) -> bool {
        loop {
            self.state = match self.state {
                ConnState::Reading => match self.try_read_request(settings) {
                    Ok(Some(req)) => {
                        trace!(peer = %self.peer, method = %req.method, target = %req.target, "Request decoded");
                        self.request = Some(req);
                        ConnState::after_read(true)
                    }
                    Ok(None) => {
                        debug!(peer = %self.peer, "Stream ended");
                        ConnState::after_read(false)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        warn!(peer = %self.peer, error = %e, "Failed to decode request");
                        ConnState::after_read(false)
                    }
                    Err(e) => {
                        debug!(peer = %self.peer, error = %e, "Read failed");
                        ConnState::after_read(false)
                    }
                },
                ConnState::Processing => match self.request.as_ref() {
                    Some(req) => {
                        let res = handler::respond(req);
                        self.keep_alive = res.keep_alive;
                        self.out.clear();
                        self.written = 0;
                        codec::encode_response(&res, &mut self.out);
                        ConnState::Writing
                    }
                    None => ConnState::Closing,
                },
                ConnState::Writing => match self.try_write_response() {
                    Ok(()) => ConnState::after_write(true, self.keep_alive),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                    Err(e) => {
                        debug!(peer = %self.peer, error = %e, "Write failed");
                        ConnState::after_write(false, self.keep_alive)
                    }
                },
                ConnState::Closing => {
                    match self.stream.shutdown(Shutdown::Write) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                        Err(e) => {
                            warn!(peer = %self.peer, error = %e, "Failed to shut down connection")
                        }
                    }
                    ConnState::Done
                }
                ConnState::Done => return true,
            };
        }
    }

    /// Decode the next request, reading as needed.
    ///
    /// `Ok(None)` is a clean end of stream; decode errors surface as
    /// `InvalidData`.
    fn try_read_request(&mut self, settings: &SessionSettings) -> io::Result<Option<Request>> {
        loop {
            match self.parser.parse(&self.buffer) {
                ParseResult::Complete(req, consumed) => {
                    self.buffer.advance(consumed);
                    return Ok(Some(req));
                }
                ParseResult::Error(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                ParseResult::Incomplete => {}
            }

            match read_into(&mut self.stream, &mut self.buffer, settings.buffer_size) {
                Ok(0) if self.buffer.is_empty() => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        HttpError::PartialMessage,
                    ))
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn try_write_response(&mut self) -> io::Result<()> {
        while self.written < self.out.len() {
            match self.stream.write(&self.out[self.written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => self.written += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Smallest read attempted, whatever the configured buffer size.
const MIN_READ_SIZE: usize = 512;

/// Read once into the spare capacity of `buf`, growing it by at least `chunk`
/// bytes.
fn read_into(stream: &mut TcpStream, buf: &mut BytesMut, chunk: usize) -> io::Result<usize> {
    let filled = buf.len();
    buf.resize(filled + chunk.max(MIN_READ_SIZE), 0);
    match stream.read(&mut buf[filled..]) {
        Ok(n) => {
            buf.truncate(filled + n);
            Ok(n)
        }
        Err(e) => {
            buf.truncate(filled);
            Err(e)
        }
    }
}

/// Single-threaded readiness loop owning the listener and every session.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    /// `None` once an accept error has ended listening.
    listener: Option<TcpListener>,
    sessions: Slab<MioSession>,
    settings: SessionSettings,
}

impl EventLoop {
    /// Create the poller and register a listener bound to `endpoint`.
    pub fn bind(
        endpoint: Endpoint,
        backlog: i32,
        settings: SessionSettings,
    ) -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(ServerError::Scheduler)?;

        let mut listener = TcpListener::from_std(bind_listener(endpoint, backlog)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Scheduler)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener: Some(listener),
            sessions: Slab::new(),
            settings,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.listener {
            Some(listener) => listener.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "not listening")),
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Process events until `stop` is set.
    ///
    /// Sessions still open when the loop returns are left as they are.
    pub fn run(&mut self, stop: &AtomicBool) -> io::Result<()> {
        let mut ready = Vec::with_capacity(EVENTS_CAPACITY);

        while !stop.load(Ordering::SeqCst) {
            match self.poll.poll(&mut self.events, Some(STOP_CHECK_INTERVAL)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            ready.clear();
            ready.extend(self.events.iter().map(|event| event.token()));

            for token in ready.iter().copied() {
                match token {
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(conn_id) => self.handle_session_event(conn_id),
                }
            }
        }

        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener.accept() {
                Ok((stream, peer)) => {
                    let entry = self.sessions.vacant_entry();
                    let conn_id = entry.key();
                    let session = entry.insert(MioSession::new(stream, peer, &self.settings));

                    if let Err(e) = self.poll.registry().register(
                        &mut session.stream,
                        Token(conn_id),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        self.sessions.remove(conn_id);
                        continue;
                    }

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "Accept failed, no longer listening");
                    if let Some(mut listener) = self.listener.take() {
                        let _ = self.poll.registry().deregister(&mut listener);
                    }
                    return;
                }
            }
        }
    }

    fn handle_session_event(&mut self, conn_id: usize) {
        let Some(session) = self.sessions.get_mut(conn_id) else {
            return;
        };

        if session.drive(&self.settings) {
            self.close_session(conn_id);
        }
    }

    fn close_session(&mut self, conn_id: usize) {
        if let Some(mut session) = self.sessions.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut session.stream);
            debug!(conn_id, peer = %session.peer, "Connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler::BODY;
    use crate::http::Limits;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    struct Server {
        addr: SocketAddr,
        stop: Arc<AtomicBool>,
        handle: thread::JoinHandle<usize>,
    }

    impl Server {
        fn start() -> Server {
            Server::start_with(SessionSettings::default())
        }

        fn start_with(settings: SessionSettings) -> Server {
            let stop = Arc::new(AtomicBool::new(false));
            let (addr_tx, addr_rx) = mpsc::channel();

            let thread_stop = Arc::clone(&stop);
            let handle = thread::spawn(move || {
                let endpoint = Endpoint::new("127.0.0.1".parse().unwrap(), 0);
                let mut event_loop = EventLoop::bind(endpoint, 16, settings).unwrap();
                addr_tx.send(event_loop.local_addr().unwrap()).unwrap();
                event_loop.run(&thread_stop).unwrap();
                event_loop.session_count()
            });

            Server {
                addr: addr_rx.recv().unwrap(),
                stop,
                handle,
            }
        }

        fn connect(&self) -> StdTcpStream {
            let stream = StdTcpStream::connect(self.addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
        }

        fn stop(self) -> usize {
            self.stop.store(true, Ordering::SeqCst);
            self.handle.join().unwrap()
        }
    }

    fn round_trip(stream: &mut StdTcpStream, request: &[u8]) -> String {
        stream.write_all(request).unwrap();
        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        while !response.ends_with(BODY.as_bytes()) {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "connection closed before response");
            response.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(response).unwrap()
    }

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";

    #[test]
    fn test_keep_alive_and_clean_close() {
        let server = Server::start();
        let mut client = server.connect();

        let first = round_trip(&mut client, REQUEST);
        let second = round_trip(&mut client, REQUEST);
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(first.contains("Content-Type: text/html\r\n"));
        assert_eq!(first, second);

        client.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        server.stop();
    }

    #[test]
    fn test_connection_close_request_ends_session() {
        let server = Server::start();
        let mut client = server.connect();

        let response = round_trip(
            &mut client,
            b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        );
        assert!(response.contains("Connection: close\r\n"));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        server.stop();
    }

    #[test]
    fn test_pipelined_requests() {
        let server = Server::start();
        let mut client = server.connect();

        let mut pipelined = REQUEST.to_vec();
        pipelined.extend_from_slice(REQUEST);
        client.write_all(&pipelined).unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        while response
            .windows(BODY.len())
            .filter(|w| *w == BODY.as_bytes())
            .count()
            < 2
        {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0);
            response.extend_from_slice(&buf[..n]);
        }

        server.stop();
    }

    #[test]
    fn test_isolation_and_accept_independence() {
        let server = Server::start();

        // Silent client parked in Reading.
        let mut idle = server.connect();

        let mut bad = server.connect();
        bad.write_all(b"BROKEN\r\n\r\n").unwrap();
        let mut rest = Vec::new();
        let _ = bad.read_to_end(&mut rest);
        assert!(rest.is_empty());

        let mut good = server.connect();
        let response = round_trip(&mut good, REQUEST);
        assert!(response.ends_with(BODY));

        let response = round_trip(&mut idle, REQUEST);
        assert!(response.ends_with(BODY));

        server.stop();
    }

    #[test]
    fn test_zero_buffer_size_still_serves() {
        let server = Server::start_with(SessionSettings {
            buffer_size: 0,
            ..SessionSettings::default()
        });
        let mut client = server.connect();

        let response = round_trip(&mut client, REQUEST);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

        server.stop();
    }

    #[test]
    fn test_oversized_trailers_close_session() {
        let server = Server::start_with(SessionSettings {
            buffer_size: 256,
            limits: Limits {
                max_headers_size: 1024,
                max_body_size: 1024,
            },
        });
        let mut bad = server.connect();
        bad.write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n")
            .unwrap();
        // The session gives up once the trailers pass the head limit, so
        // later writes may fail with a reset.
        let _ = bad.write_all(&[b'a'; 4096]);

        let mut rest = Vec::new();
        let _ = bad.read_to_end(&mut rest);
        assert!(rest.is_empty());

        let mut good = server.connect();
        let response = round_trip(&mut good, REQUEST);
        assert!(response.ends_with(BODY));

        server.stop();
    }

    #[test]
    fn test_stop_abandons_open_sessions() {
        let server = Server::start();
        let mut idle = server.connect();
        let _ = round_trip(&mut idle, REQUEST);

        // The idle session is still waiting for its next request.
        assert_eq!(server.stop(), 1);
    }
}
