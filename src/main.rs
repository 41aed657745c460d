//! coop-httpd: a minimal single-threaded HTTP/1.1 server
//!
//! Accepts any number of connections on one cooperative scheduler and
//! answers every request with a fixed page:
//! - Persistent connections (keep-alive mirrored from the request)
//! - Graceful half-close when a connection ends
//! - Cooperative stop on SIGINT/SIGTERM
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod http;
mod runtime;

use config::{Config, RuntimeType};
use runtime::SessionSettings;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(target) = config.get.as_deref() {
        return fetch(target);
    }

    let endpoint = config.endpoint()?;
    let settings = SessionSettings::from(&config);

    info!(
        endpoint = %endpoint,
        runtime = ?config.runtime,
        backlog = config.backlog,
        "Starting coop-httpd"
    );

    match config.runtime {
        RuntimeType::Tokio => run_tokio(endpoint, config.backlog, settings),
        RuntimeType::Mio => run_mio(endpoint, config.backlog, settings),
    }
}

/// Run with the tokio current-thread scheduler
fn run_tokio(
    endpoint: runtime::Endpoint,
    backlog: i32,
    settings: SessionSettings,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using tokio runtime (current thread)");
    runtime::run_tokio(endpoint, backlog, settings)?;
    Ok(())
}

/// Run with the mio event loop (epoll/kqueue)
fn run_mio(
    endpoint: runtime::Endpoint,
    backlog: i32,
    settings: SessionSettings,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using mio runtime (epoll/kqueue)");
    runtime::run_mio(endpoint, backlog, settings)?;
    Ok(())
}

/// Fetch `/` once from HOST:PORT and print the response.
fn fetch(target: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (host, port) = client::split_target(target)
        .ok_or_else(|| format!("Invalid target '{}', expected HOST:PORT", target))?;

    let res = client::http_get(host, port)?;
    println!("{res}");
    Ok(())
}
