//! Connection-handling core.
//!
//! Two interchangeable single-threaded backends:
//! - `tokio`: a current-thread runtime with a `LocalSet`; the listener and
//!   each session are tasks that suspend on accept, read and write
//! - `mio`: a hand-driven readiness loop stepping explicit session state
//!   machines
//!
//! Both share:
//! - `ConnState`: the per-session state machine
//! - `Endpoint` / `bind_listener`: socket setup and `BindError`
//! - the `http` codec and handler

mod connection;
mod listener;
mod mio;
mod scheduler;
mod session;

pub use connection::SessionSettings;
pub use listener::{BindError, Endpoint};
pub use scheduler::Scheduler;

use std::fmt;
use std::io;
use tracing::info;

/// Fatal server errors; any of these ends the process with a nonzero exit.
#[derive(Debug)]
pub enum ServerError {
    /// The scheduler (runtime, poller or signal registration) could not be set up.
    Scheduler(io::Error),
    /// The listening endpoint could not be established.
    Bind(BindError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Scheduler(e) => write!(f, "Failed to start scheduler: {}", e),
            ServerError::Bind(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Scheduler(e) => Some(e),
            ServerError::Bind(e) => Some(e),
        }
    }
}

impl From<BindError> for ServerError {
    fn from(e: BindError) -> Self {
        ServerError::Bind(e)
    }
}

/// Run the tokio backend until SIGINT or SIGTERM.
pub fn run_tokio(
    endpoint: Endpoint,
    backlog: i32,
    settings: SessionSettings,
) -> Result<(), ServerError> {
    let scheduler = Scheduler::new().map_err(ServerError::Scheduler)?;
    let shutdown = scheduler.watch_signals().map_err(ServerError::Scheduler)?;

    let addr = scheduler.listen(endpoint, backlog, settings)?;
    info!(addr = %addr, "Listening");

    let signal = scheduler.run_until(shutdown);
    info!(signal, "Shutdown requested, abandoning open connections");
    Ok(())
}

/// Run the mio backend until SIGINT or SIGTERM.
pub fn run_mio(
    endpoint: Endpoint,
    backlog: i32,
    settings: SessionSettings,
) -> Result<(), ServerError> {
    mio::run(endpoint, backlog, settings)
}
