//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from the system clock. Production drivers use
//! `std::time::Instant`; the simulation harness uses a virtual clock that only
//! moves when a test advances it, so handshake timeouts, heartbeats, and
//! reconnect backoff can be exercised without waiting.

use std::{
    fmt::Debug,
    future::Future,
    ops::{Add, Sub},
    time::Duration,
};

/// Monotonic point in time usable by the state machines.
///
/// Implemented for any type with instant-like arithmetic, including
/// `std::time::Instant`.
pub trait MonotonicInstant:
    Copy + Ord + Send + Sync + Debug + Add<Duration, Output = Self> + Sub<Output = Duration>
{
}

impl<T> MonotonicInstant for T where
    T: Copy + Ord + Send + Sync + Debug + Add<Duration, Output = T> + Sub<Output = Duration>
{
}

/// Abstract environment providing time and async sleeping.
///
/// # Invariants
///
/// - `now()` never goes backwards within one execution context.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`, simulation uses
    /// virtual time.
    type Instant: MonotonicInstant;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code awaits this. State machines take `now` as a
    /// parameter instead.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Wall clock in milliseconds since the Unix epoch.
    ///
    /// Used for informational wire timestamps (heartbeat pings), never for
    /// timeout decisions.
    fn wall_clock_millis(&self) -> u64;
}
