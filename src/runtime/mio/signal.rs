//! Termination signal capture for the mio event loop.
//!
//! The handler only stores into atomics; the event loop notices the flag at
//! its next wakeup (poll is interrupted by the signal or times out).

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static STOP: AtomicBool = AtomicBool::new(false);
static RECEIVED: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_signal(signum: libc::c_int) {
    RECEIVED.store(signum, Ordering::SeqCst);
    STOP.store(true, Ordering::SeqCst);
}

/// Install handlers for SIGINT and SIGTERM; returns the flag they set.
pub fn install() -> io::Result<&'static AtomicBool> {
    for signum in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: `action` is fully initialised before use and `on_signal`
        // only touches atomics, which is async-signal-safe.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(&STOP)
}

/// The last signal number recorded by the handler, 0 if none.
pub fn received() -> i32 {
    RECEIVED.load(Ordering::SeqCst)
}

pub fn name(signum: i32) -> &'static str {
    match signum {
        libc::SIGINT => "SIGINT",
        libc::SIGTERM => "SIGTERM",
        _ => "none",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(name(libc::SIGINT), "SIGINT");
        assert_eq!(name(libc::SIGTERM), "SIGTERM");
        assert_eq!(name(0), "none");
    }
}
