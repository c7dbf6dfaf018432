//! Simulation environment on tokio's clock.
//!
//! Under `#[tokio::test(start_paused = true)]` the clock only moves when every
//! task is idle or a test calls `tokio::time::advance`, so auth timeouts,
//! heartbeats and reconnect backoff run in virtual time. Outside a paused
//! runtime it behaves like the system clock.

use std::time::Duration;

use courtside_core::Environment;
use tokio::time::Instant;

/// Wall-clock origin reported by a fresh environment: 2026-01-01T00:00:00Z.
pub const SIM_EPOCH_MILLIS: u64 = 1_767_225_600_000;

/// Environment for deterministic simulation.
#[derive(Debug, Clone, Copy)]
pub struct SimEnv {
    origin: Instant,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Environment whose wall clock starts at [`SIM_EPOCH_MILLIS`] now.
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    /// Instant this environment was created at.
    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// `origin + offset`, for driving state machines without sleeping.
    pub fn at(&self, offset: Duration) -> Instant {
        self.origin + offset
    }
}

impl Environment for SimEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn wall_clock_millis(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        SIM_EPOCH_MILLIS + elapsed.as_millis() as u64
    }
}
