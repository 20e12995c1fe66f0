//! Server clock used for handshake timing.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Millisecond clock shared by every connection.
///
/// The value wraps after about 49 days, like the client's own counter.
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the server started.
    fn server_time(&self) -> u32;
}

/// Monotonic wall clock anchored at construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    /// Start counting from now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn server_time(&self) -> u32 {
        // Truncation is the intended wrap-around.
        self.started.elapsed().as_millis() as u32
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    /// Clock reading `start` milliseconds.
    pub fn new(start: u32) -> Self {
        Self {
            now: AtomicU32::new(start),
        }
    }

    /// Jump to `now`.
    pub fn set(&self, now: u32) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `millis`, wrapping like the real clock.
    pub fn advance(&self, millis: u32) {
        // fetch_add wraps on overflow
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn server_time(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}
