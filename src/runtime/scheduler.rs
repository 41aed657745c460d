//! Single-threaded cooperative scheduler for the tokio backend.
//!
//! One current-thread runtime drives one `LocalSet`. Tasks only switch at
//! their await points, so sessions need no locking. Stopping is cooperative:
//! `run_until` returns once the shutdown future resolves, and whatever is
//! still suspended at that point is dropped without finishing.

use crate::runtime::connection::SessionSettings;
use crate::runtime::listener::{BindError, Endpoint, Listener};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::runtime::{Builder, Runtime};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::LocalSet;

pub struct Scheduler {
    // Declared first so pending tasks drop before the runtime's drivers.
    tasks: LocalSet,
    runtime: Runtime,
}

impl Scheduler {
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            tasks: LocalSet::new(),
            runtime,
        })
    }

    /// Register interest in SIGINT and SIGTERM.
    ///
    /// The returned future resolves with the name of the first signal seen.
    pub fn watch_signals(&self) -> io::Result<impl Future<Output = &'static str>> {
        let _guard = self.runtime.enter();
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        Ok(async move {
            tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            }
        })
    }

    /// Bind `endpoint` and spawn the accept loop as a detached task.
    pub fn listen(
        &self,
        endpoint: Endpoint,
        backlog: i32,
        settings: SessionSettings,
    ) -> Result<SocketAddr, BindError> {
        let _guard = self.runtime.enter();
        let listener = Listener::bind(endpoint, backlog, settings)?;
        let addr = listener
            .local_addr()
            .map_err(|source| BindError { endpoint, source })?;

        self.tasks.spawn_local(listener.run());
        Ok(addr)
    }

    /// Drive all tasks until `shutdown` completes.
    ///
    /// Consumes the scheduler: tasks still pending afterwards are abandoned
    /// along with it.
    pub fn run_until<F: Future>(self, shutdown: F) -> F::Output {
        self.runtime.block_on(self.tasks.run_until(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler::BODY;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn loopback() -> Endpoint {
        Endpoint::new("127.0.0.1".parse().unwrap(), 0)
    }

    /// Start a scheduler on its own thread; returns its address, a stop
    /// trigger and the thread handle.
    fn start() -> (SocketAddr, oneshot::Sender<()>, thread::JoinHandle<()>) {
        let (addr_tx, addr_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let handle = thread::spawn(move || {
            let scheduler = Scheduler::new().unwrap();
            let addr = scheduler
                .listen(loopback(), 16, SessionSettings::default())
                .unwrap();
            addr_tx.send(addr).unwrap();
            scheduler.run_until(async {
                let _ = stop_rx.await;
            });
        });

        (addr_rx.recv().unwrap(), stop_tx, handle)
    }

    #[test]
    fn test_serves_until_stopped() {
        let (addr, stop, handle) = start();

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        while !response.ends_with(BODY.as_bytes()) {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0);
            response.extend_from_slice(&buf[..n]);
        }

        stop.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_abandons_suspended_session() {
        let (addr, stop, handle) = start();

        // Connected but silent: its session is parked awaiting a read.
        let _idle = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));

        stop.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_sigterm_stops_with_idle_session() {
        let (addr_tx, addr_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let scheduler = Scheduler::new().unwrap();
            let shutdown = scheduler.watch_signals().unwrap();
            let addr = scheduler
                .listen(loopback(), 16, SessionSettings::default())
                .unwrap();
            addr_tx.send(addr).unwrap();
            scheduler.run_until(shutdown)
        });

        let _idle = TcpStream::connect(addr_rx.recv().unwrap()).unwrap();
        thread::sleep(Duration::from_millis(50));

        // SAFETY: tokio's handler for SIGTERM is installed by `watch_signals`
        // before the address is sent.
        assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);
        assert_eq!(handle.join().unwrap(), "SIGTERM");
    }
}
