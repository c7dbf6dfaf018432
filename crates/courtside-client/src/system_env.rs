//! Production Environment implementation using system time.
//!
//! `SystemEnv` reads the monotonic clock for every timing decision and the
//! wall clock only for informational heartbeat timestamps.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use courtside_core::Environment;

/// Production environment using system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::disallowed_methods)]
    fn wall_clock_millis(&self) -> u64 {
        // A clock before the epoch only skews the informational ping stamp.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}
