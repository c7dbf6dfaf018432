//! Property-based tests for the connection state machine.
//!
//! Drives `ConnectionManager` through arbitrary timings the way a driver
//! would, executing close requests by reporting the socket closed.

use std::{
    future,
    ops::{Add, Sub},
    time::Duration,
};

use courtside_core::{
    ConnectionAction, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager,
    ConnectionState, Environment, StaticCredential,
};
use courtside_proto::{ClientFrame, ServerFrame, close_code};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct At(Duration);

impl Add<Duration> for At {
    type Output = At;

    fn add(self, rhs: Duration) -> At {
        At(self.0 + rhs)
    }
}

impl Sub for At {
    type Output = Duration;

    fn sub(self, rhs: At) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

#[derive(Clone)]
struct TestEnv;

impl Environment for TestEnv {
    type Instant = At;

    fn now(&self) -> At {
        At(Duration::ZERO)
    }

    fn sleep(&self, _duration: Duration) -> impl Future<Output = ()> + Send {
        future::ready(())
    }

    fn wall_clock_millis(&self) -> u64 {
        1_700_000_000_000
    }
}

fn ms(n: u64) -> At {
    At(Duration::from_millis(n))
}

fn manager(config: ConnectionConfig) -> ConnectionManager<TestEnv, StaticCredential> {
    ConnectionManager::new(TestEnv, StaticCredential::new("token"), config)
}

fn errors(actions: &[ConnectionAction]) -> Vec<ConnectionError> {
    actions
        .iter()
        .filter_map(|action| match action {
            ConnectionAction::Emit(ConnectionEvent::Error(err)) => Some(err.clone()),
            _ => None,
        })
        .collect()
}

fn close_code_of(actions: &[ConnectionAction]) -> Option<u16> {
    actions.iter().find_map(|action| match action {
        ConnectionAction::CloseTransport { code, .. } => Some(*code),
        _ => None,
    })
}

fn sends_ping(actions: &[ConnectionAction]) -> bool {
    actions.iter().any(|a| matches!(a, ConnectionAction::SendFrame(ClientFrame::Ping { .. })))
}

fn opens(actions: &[ConnectionAction]) -> bool {
    actions.iter().any(|a| matches!(a, ConnectionAction::OpenTransport))
}

proptest! {
    /// Without `auth_success` the handshake fails exactly at the timeout,
    /// and no heartbeat or retry follows.
    #[test]
    fn prop_auth_timeout_fails_without_heartbeat(
        timeout_ms in 100u64..30_000,
        opened_at in 0u64..10_000,
        early_ticks in prop::collection::vec(0.0f64..1.0, 0..10),
    ) {
        let config = ConnectionConfig {
            auth_timeout: Duration::from_millis(timeout_ms),
            ..ConnectionConfig::default()
        };
        let mut conn = manager(config);
        conn.connect().unwrap();
        conn.transport_opened(ms(opened_at));

        for fraction in early_ticks {
            let offset = (timeout_ms as f64 * fraction) as u64;
            let actions = conn.tick(ms(opened_at + offset.min(timeout_ms - 1)));
            prop_assert!(actions.is_empty());
            prop_assert_eq!(conn.state(), ConnectionState::Authenticating);
        }

        let actions = conn.tick(ms(opened_at + timeout_ms));
        prop_assert_eq!(close_code_of(&actions), Some(close_code::AUTH_TIMEOUT));
        let failed = errors(&actions)
            .into_iter()
            .any(|e| matches!(e, ConnectionError::AuthenticationFailed { .. }));
        prop_assert!(failed, "timeout must surface AuthenticationFailed");

        // Driver executes the close.
        let closed = conn.transport_closed(Some(close_code::AUTH_TIMEOUT), true, ms(opened_at + timeout_ms));
        prop_assert!(!opens(&closed));
        prop_assert_eq!(conn.state(), ConnectionState::Disconnected);
        let recorded = matches!(conn.failure(), Some(ConnectionError::AuthenticationFailed { .. }));
        prop_assert!(recorded);

        // A late auth_success is ignored and nothing fires afterwards.
        prop_assert!(conn.handle_frame(ServerFrame::AuthSuccess, ms(opened_at + timeout_ms + 1)).is_empty());
        for minutes in 1..=10u64 {
            let later = conn.tick(ms(opened_at + timeout_ms + minutes * 60_000));
            prop_assert!(!sends_ping(&later) && !opens(&later));
        }
    }

    /// N consecutive unclean closes with no reauthentication stop the retry
    /// loop with `ConnectionFailedPermanently`.
    #[test]
    fn prop_gives_up_after_max_attempts(
        max_attempts in 1u32..8,
        open_before_close in prop::collection::vec(any::<bool>(), 8),
    ) {
        let config = ConnectionConfig { max_reconnect_attempts: max_attempts, ..ConnectionConfig::default() };
        let mut conn = manager(config.clone());
        conn.connect().unwrap();
        let mut now = 0u64;

        for attempt in 1..=max_attempts {
            // Some attempts get a socket before dropping; none authenticate.
            if open_before_close[attempt as usize - 1] {
                conn.transport_opened(ms(now));
            }
            let actions = conn.transport_closed(None, false, ms(now));
            prop_assert_eq!(conn.reconnect_attempt(), attempt);

            if attempt < max_attempts {
                let delay = config.backoff_delay(attempt);
                let scheduled = actions.iter().any(|a| matches!(
                    a,
                    ConnectionAction::Emit(ConnectionEvent::ReconnectScheduled { attempt: n, delay: d })
                        if *n == attempt && *d == delay
                ));
                prop_assert!(scheduled, "attempt {} not scheduled", attempt);
                prop_assert!(errors(&actions).is_empty());

                now += delay.as_millis() as u64;
                prop_assert!(opens(&conn.tick(ms(now))));
            } else {
                prop_assert_eq!(
                    errors(&actions),
                    vec![ConnectionError::ConnectionFailedPermanently { attempts: max_attempts }]
                );
            }
        }

        prop_assert_eq!(conn.state(), ConnectionState::Disconnected);
        prop_assert_eq!(conn.next_deadline(), None);
        prop_assert!(!opens(&conn.tick(ms(now + 3_600_000))));
    }

    /// Backoff starts at the base delay, doubles, and never exceeds the cap.
    #[test]
    fn prop_backoff_is_capped_and_monotonic(
        base_ms in 1u64..5_000,
        cap_factor in 1u32..64,
        attempts in 1u32..40,
    ) {
        let config = ConnectionConfig {
            reconnect_base: Duration::from_millis(base_ms),
            reconnect_max: Duration::from_millis(base_ms) * cap_factor,
            ..ConnectionConfig::default()
        };

        prop_assert_eq!(config.backoff_delay(1), config.reconnect_base);
        let mut previous = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = config.backoff_delay(attempt);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= config.reconnect_max);
            previous = delay;
        }
    }

    /// A successful authentication always resets the failure count.
    #[test]
    fn prop_authentication_resets_attempts(failures in 1u32..4) {
        let mut conn = manager(ConnectionConfig::default());
        conn.connect().unwrap();
        let mut now = 0u64;

        for attempt in 1..=failures {
            conn.transport_closed(None, false, ms(now));
            now += ConnectionConfig::default().backoff_delay(attempt).as_millis() as u64;
            conn.tick(ms(now));
        }

        conn.transport_opened(ms(now));
        conn.handle_frame(ServerFrame::AuthSuccess, ms(now));

        prop_assert_eq!(conn.reconnect_attempt(), 0);
        prop_assert!(conn.is_authenticated());
        prop_assert!(conn.failure().is_none());
    }
}
