//! Turn SIGINT / SIGTERM into cooperative cancellation.
//!
//! The builder runs in its own process group, so a terminal Ctrl-C only
//! reaches this process. The handler just records the signal; a watcher
//! thread then runs the caller's cancel action so the pipeline can kill the
//! builder and remove its partial output itself.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

const WATCH_POLL: Duration = Duration::from_millis(50);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT and SIGTERM handlers.
#[cfg(unix)]
pub fn install() -> io::Result<()> {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        let previous = unsafe { libc::signal(signal, handler) };
        if previous == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install() -> io::Result<()> {
    Ok(())
}

/// Whether an interrupt has been received.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Run `action` once on a background thread when an interrupt arrives.
pub fn on_interrupt<F>(action: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::spawn(move || {
        while !interrupted() {
            std::thread::sleep(WATCH_POLL);
        }
        warn!("interrupt received; cancelling");
        action();
    })
}
