//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! Sessions are explicit state machines stepped from readiness events
//! instead of suspended tasks.

mod event_loop;
mod signal;

pub use event_loop::EventLoop;

use crate::runtime::connection::SessionSettings;
use crate::runtime::{Endpoint, ServerError};
use tracing::info;

/// Run the server using mio backend until SIGINT or SIGTERM.
pub fn run(endpoint: Endpoint, backlog: i32, settings: SessionSettings) -> Result<(), ServerError> {
    let stop = signal::install().map_err(ServerError::Scheduler)?;

    let mut event_loop = EventLoop::bind(endpoint, backlog, settings)?;
    let addr = event_loop.local_addr().map_err(ServerError::Scheduler)?;
    info!(addr = %addr, "Listening");

    event_loop.run(stop).map_err(ServerError::Scheduler)?;
    info!(
        signal = signal::name(signal::received()),
        open_connections = event_loop.session_count(),
        "Shutdown requested, abandoning open connections"
    );
    Ok(())
}
