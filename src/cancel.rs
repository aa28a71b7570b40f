//! Cooperative cancellation shared across one pipeline run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ConvertError, ConvertResult};

/// Granularity at which cancellable waits poll the token.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cloneable cancellation handle.
///
/// Every clone observes the same flag. Once cancelled a token never resets.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with [`ConvertError::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> ConvertResult<()> {
        if self.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early with an error on cancellation.
    pub fn sleep(&self, duration: Duration) -> ConvertResult<()> {
        self.check()?;
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
            self.check()?;
        }
    }
}
