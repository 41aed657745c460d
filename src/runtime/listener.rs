//! Listening socket and accept loop.

use crate::runtime::connection::SessionSettings;
use crate::runtime::session::Session;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tracing::{debug, debug_span, error, Instrument};

/// Address and port the server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    addr: SocketAddr,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// The listening endpoint could not be established.
#[derive(Debug)]
pub struct BindError {
    pub endpoint: Endpoint,
    pub source: io::Error,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to listen on {}: {}", self.endpoint, self.source)
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Create a non-blocking listening socket.
pub fn bind_listener(endpoint: Endpoint, backlog: i32) -> Result<std::net::TcpListener, BindError> {
    let bind = || -> io::Result<std::net::TcpListener> {
        let addr = endpoint.socket_addr();
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        Ok(socket.into())
    };

    bind().map_err(|source| BindError { endpoint, source })
}

/// Accepts connections and hands each one to a detached session task.
pub struct Listener {
    inner: TcpListener,
    settings: SessionSettings,
}

impl Listener {
    /// Bind to `endpoint`. Must be called inside the scheduler's runtime context.
    pub fn bind(
        endpoint: Endpoint,
        backlog: i32,
        settings: SessionSettings,
    ) -> Result<Self, BindError> {
        let std_listener = bind_listener(endpoint, backlog)?;
        let inner =
            TcpListener::from_std(std_listener).map_err(|source| BindError { endpoint, source })?;
        Ok(Self { inner, settings })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept until an accept error ends the loop.
    ///
    /// Sessions are spawned onto the current `LocalSet` and never awaited.
    pub async fn run(self) {
        loop {
            match self.inner.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    let session = Session::new(stream, self.settings);
                    tokio::task::spawn_local(
                        async move {
                            session.run().await;
                            debug!("Connection closed");
                        }
                        .instrument(debug_span!("session", peer = %peer)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept failed, no longer listening");
                    return;
                }
            }
        }
    }
}
