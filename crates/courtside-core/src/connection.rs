//! Socket lifecycle state machine.
//!
//! Owns one logical connection per signed-in session: open, authenticate,
//! heartbeat, and reconnect with capped exponential backoff. Uses the action
//! pattern: methods take time as input and return actions for the driver to
//! execute. The driver owns the actual socket.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────┐ connect  ┌────────────┐ opened ┌──────┐ auth ┌────────────────┐
//! │ Disconnected │─────────>│ Connecting │───────>│ Open │─────>│ Authenticating │
//! └──────────────┘          └────────────┘        └──────┘      └────────────────┘
//!        ^                                                          │        │
//!        │ closed (backoff timer re-enters Connecting)   auth_success│        │ error / timeout
//!        │                                                          v        v
//!        │                 ┌─────────┐                   ┌───────────────┐ ┌─────────┐
//!        └─────────────────│ Closing │<──────────────────│ Authenticated │ │ Closing │
//!                          └─────────┘     teardown      └───────────────┘ └─────────┘
//! ```
//!
//! # Reconnect policy
//!
//! An unclean close whose code is not in
//! [`close_code::NO_RETRY`](courtside_proto::close_code::NO_RETRY) counts as a
//! failed attempt. Attempt `n` waits `min(max, base * 2^(n-1))`; once the
//! count reaches `max_reconnect_attempts` the manager reports
//! [`ConnectionError::ConnectionFailedPermanently`] and stops. A successful
//! authentication resets the count, and so does an explicit
//! [`ConnectionManager::connect`], which starts a fresh attempt budget.

use std::time::Duration;

use courtside_proto::{ClientFrame, ConversationId, Message, ServerFrame, close_code};

use crate::{credential::CredentialProvider, env::Environment, error::ConnectionError};

/// Time allowed between sending `auth` and receiving `auth_success`.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between pings while authenticated.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before the first reconnect attempt.
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Upper bound on any reconnect delay.
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Consecutive failed attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Actions returned by the connection state machine.
///
/// The driver executes these in order:
/// - `OpenTransport`: open a new socket to the configured endpoint
/// - `SendFrame`: serialize and write the frame
/// - `CloseTransport`: close the socket with the given code
/// - `Emit`: deliver the event to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Open a new socket
    OpenTransport,

    /// Send this frame to the server
    SendFrame(ClientFrame),

    /// Close the socket
    CloseTransport {
        /// WebSocket close code
        code: u16,
        /// Close reason
        reason: String,
    },

    /// Deliver an event to subscribers
    Emit(ConnectionEvent),
}

/// Events observed by connection subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Lifecycle state changed
    StateChanged(ConnectionState),
    /// Socket opened, handshake not yet complete
    Opened,
    /// Handshake completed
    Authenticated,
    /// Message broadcast on a joined channel
    Message {
        /// Channel the message arrived on
        conversation_id: ConversationId,
        /// Message record
        message: Message,
    },
    /// Something failed
    Error(ConnectionError),
    /// Socket closed
    Closed {
        /// Close code, if the peer sent one
        code: Option<u16>,
        /// Whether the close handshake completed
        was_clean: bool,
    },
    /// A reconnect attempt is pending
    ReconnectScheduled {
        /// Attempt number, starting at 1
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket. Initial, terminal after teardown, and between retries
    Disconnected,
    /// Socket requested, not yet open
    Connecting,
    /// Socket open, `auth` not yet sent
    Open,
    /// `auth` sent, waiting for `auth_success`
    Authenticating,
    /// Handshake complete, joins and broadcasts allowed
    Authenticated,
    /// Local close requested, waiting for the socket to close
    Closing,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for completing the auth handshake
    pub auth_timeout: Duration,
    /// Interval between pings while authenticated
    pub heartbeat_interval: Duration,
    /// Delay before the first reconnect attempt
    pub reconnect_base: Duration,
    /// Cap on reconnect delay
    pub reconnect_max: Duration,
    /// Consecutive failed attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_max: DEFAULT_RECONNECT_MAX,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ConnectionConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.reconnect_base.saturating_mul(factor).min(self.reconnect_max)
    }
}

/// What to do once the socket reports closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseDisposition {
    /// Apply the reconnect policy
    Retry,
    /// Failure already surfaced, stay disconnected
    Hold,
}

/// Connection state machine
///
/// Manages the socket lifecycle for one session. Pure: no I/O. Time is
/// passed to every method that needs it; the environment is only consulted
/// for wall-clock ping timestamps.
pub struct ConnectionManager<E: Environment, C: CredentialProvider> {
    env: E,
    credentials: C,
    config: ConnectionConfig,
    state: ConnectionState,
    /// Token resolved for the attempt in flight, consumed by the auth frame
    pending_token: Option<String>,
    reconnect_attempt: u32,
    last_heartbeat_ack: Option<E::Instant>,
    auth_deadline: Option<E::Instant>,
    next_ping: Option<E::Instant>,
    reconnect_at: Option<E::Instant>,
    client_id: Option<String>,
    failure: Option<ConnectionError>,
    disposition: CloseDisposition,
    /// Explicit connect received while closing, started once the socket is gone
    connect_after_close: bool,
    torn_down: bool,
}

impl<E: Environment, C: CredentialProvider> ConnectionManager<E, C> {
    /// Create a manager in [`ConnectionState::Disconnected`].
    pub fn new(env: E, credentials: C, config: ConnectionConfig) -> Self {
        Self {
            env,
            credentials,
            config,
            state: ConnectionState::Disconnected,
            pending_token: None,
            reconnect_attempt: 0,
            last_heartbeat_ack: None,
            auth_deadline: None,
            next_ping: None,
            reconnect_at: None,
            client_id: None,
            failure: None,
            disposition: CloseDisposition::Retry,
            connect_after_close: false,
            torn_down: false,
        }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once `auth_success` arrived on the current socket.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    /// True while a socket is open, authenticated or not.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Authenticating | ConnectionState::Authenticated
        )
    }

    /// True after [`Self::teardown`]. The manager never reconnects again.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Consecutive failed attempts since the last successful authentication.
    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    /// Time of the last `pong`. `None` until one arrives.
    #[must_use]
    pub fn last_heartbeat_ack(&self) -> Option<E::Instant> {
        self.last_heartbeat_ack
    }

    /// Server-side socket identifier from the `connected` greeting.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Most recent failure that stopped automatic reconnection.
    #[must_use]
    pub fn failure(&self) -> Option<&ConnectionError> {
        self.failure.as_ref()
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Earliest instant at which [`Self::tick`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<E::Instant> {
        [self.auth_deadline, self.next_ping, self.reconnect_at].into_iter().flatten().min()
    }

    /// Start connecting.
    ///
    /// No-op if a socket is already connecting or open. From `Disconnected`
    /// it cancels any pending reconnect timer, clears a previous failure and
    /// starts a fresh attempt with a full reconnect budget. While `Closing`
    /// the request is remembered and the attempt starts once the old socket
    /// reports closed.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` after teardown
    /// - `ConnectionError::NotAuthenticated` if no credential is available
    pub fn connect(&mut self) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.torn_down {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "connect".to_string(),
            });
        }

        match self.state {
            ConnectionState::Disconnected => {},
            ConnectionState::Closing => {
                tracing::debug!("connect deferred until the closing socket is gone");
                self.connect_after_close = true;
                return Ok(Vec::new());
            },
            _ => {
                tracing::debug!(state = ?self.state, "connect ignored, socket already active");
                return Ok(Vec::new());
            },
        }

        self.reconnect_attempt = 0;
        self.failure = None;
        self.begin_attempt()
    }

    /// Socket finished opening. Sends `auth` and arms the handshake timeout.
    pub fn transport_opened(&mut self, now: E::Instant) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Connecting {
            tracing::debug!(state = ?self.state, "ignoring open for abandoned attempt");
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.transition(ConnectionState::Open, &mut actions);
        actions.push(ConnectionAction::Emit(ConnectionEvent::Opened));

        match self.pending_token.take() {
            Some(token) => {
                actions.push(ConnectionAction::SendFrame(ClientFrame::Auth { token }));
                self.auth_deadline = Some(now + self.config.auth_timeout);
                self.transition(ConnectionState::Authenticating, &mut actions);
            },
            None => self.fail_authentication(
                "credential unavailable".to_string(),
                close_code::AUTH_REJECTED,
                &mut actions,
            ),
        }

        actions
    }

    /// Handle a decoded frame from the server.
    pub fn handle_frame(&mut self, frame: ServerFrame, now: E::Instant) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        match frame {
            ServerFrame::AuthSuccess => {
                if self.state != ConnectionState::Authenticating {
                    tracing::debug!(state = ?self.state, "unexpected auth_success");
                    return actions;
                }

                self.auth_deadline = None;
                self.reconnect_attempt = 0;
                self.failure = None;
                self.next_ping = Some(now + self.config.heartbeat_interval);
                self.transition(ConnectionState::Authenticated, &mut actions);
                actions.push(ConnectionAction::Emit(ConnectionEvent::Authenticated));
                tracing::info!(client_id = ?self.client_id, "authenticated");
            },
            ServerFrame::Connected { client_id } => {
                tracing::debug!(%client_id, "server greeting");
                self.client_id = Some(client_id);
            },
            ServerFrame::Error { message } => {
                if self.state == ConnectionState::Authenticating {
                    self.fail_authentication(message, close_code::AUTH_REJECTED, &mut actions);
                } else {
                    tracing::warn!(%message, "server error");
                    actions.push(ConnectionAction::Emit(ConnectionEvent::Error(
                        ConnectionError::Server(message),
                    )));
                }
            },
            ServerFrame::Message { conversation_id, message } => {
                if self.is_open() {
                    actions.push(ConnectionAction::Emit(ConnectionEvent::Message {
                        conversation_id,
                        message,
                    }));
                } else {
                    tracing::debug!(state = ?self.state, "dropping message on inactive socket");
                }
            },
            ServerFrame::Pong => {
                self.last_heartbeat_ack = Some(now);
            },
            ServerFrame::Unknown => {
                tracing::warn!("ignoring frame with unknown type");
            },
        }

        actions
    }

    /// Process timeouts, heartbeats, and scheduled reconnects.
    ///
    /// Call at least as often as [`Self::next_deadline`] requires.
    pub fn tick(&mut self, now: E::Instant) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        match self.state {
            ConnectionState::Authenticating => {
                if self.auth_deadline.is_some_and(|deadline| now >= deadline) {
                    let reason =
                        format!("no auth_success within {:?}", self.config.auth_timeout);
                    tracing::warn!(%reason, "auth handshake timed out");
                    self.fail_authentication(reason, close_code::AUTH_TIMEOUT, &mut actions);
                }
            },
            ConnectionState::Authenticated => {
                if self.next_ping.is_some_and(|due| now >= due) {
                    let timestamp = self.env.wall_clock_millis();
                    actions.push(ConnectionAction::SendFrame(ClientFrame::Ping { timestamp }));
                    self.next_ping = Some(now + self.config.heartbeat_interval);
                }
            },
            ConnectionState::Disconnected => {
                if self.reconnect_at.is_some_and(|at| now >= at) {
                    self.reconnect_at = None;
                    tracing::info!(attempt = self.reconnect_attempt, "reconnecting");
                    match self.begin_attempt() {
                        Ok(mut attempt) => actions.append(&mut attempt),
                        Err(err) => {
                            actions.push(ConnectionAction::Emit(ConnectionEvent::Error(err)))
                        },
                    }
                }
            },
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing => {},
        }

        actions
    }

    /// Socket reported a failure. A close notification follows separately.
    pub fn transport_error(&mut self, reason: impl Into<String>) -> Vec<ConnectionAction> {
        let reason = reason.into();
        tracing::warn!(%reason, state = ?self.state, "transport error");
        vec![ConnectionAction::Emit(ConnectionEvent::Error(ConnectionError::Transport(reason)))]
    }

    /// Socket closed, or failed to open.
    ///
    /// Applies the reconnect policy unless the close was clean, carried a
    /// no-retry code, followed an auth failure, or followed teardown.
    pub fn transport_closed(
        &mut self,
        code: Option<u16>,
        was_clean: bool,
        now: E::Instant,
    ) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        if self.state == ConnectionState::Disconnected {
            tracing::debug!(?code, "duplicate close notification");
            return actions;
        }

        self.auth_deadline = None;
        self.next_ping = None;
        self.pending_token = None;
        self.transition(ConnectionState::Disconnected, &mut actions);
        actions.push(ConnectionAction::Emit(ConnectionEvent::Closed { code, was_clean }));

        if self.torn_down {
            return actions;
        }

        if std::mem::take(&mut self.connect_after_close) {
            match self.connect() {
                Ok(mut attempt) => actions.append(&mut attempt),
                Err(err) => actions.push(ConnectionAction::Emit(ConnectionEvent::Error(err))),
            }
            return actions;
        }

        if self.disposition == CloseDisposition::Hold {
            self.disposition = CloseDisposition::Retry;
            return actions;
        }

        let effective = code.unwrap_or(close_code::ABNORMAL);
        if was_clean || close_code::is_terminal(effective) {
            tracing::info!(code = effective, was_clean, "socket closed, not retrying");
            return actions;
        }

        self.reconnect_attempt += 1;
        if self.reconnect_attempt >= self.config.max_reconnect_attempts {
            let err =
                ConnectionError::ConnectionFailedPermanently { attempts: self.reconnect_attempt };
            tracing::error!(attempts = self.reconnect_attempt, "giving up on reconnect");
            self.failure = Some(err.clone());
            actions.push(ConnectionAction::Emit(ConnectionEvent::Error(err)));
            return actions;
        }

        let delay = self.config.backoff_delay(self.reconnect_attempt);
        self.reconnect_at = Some(now + delay);
        tracing::info!(attempt = self.reconnect_attempt, ?delay, "reconnect scheduled");
        actions.push(ConnectionAction::Emit(ConnectionEvent::ReconnectScheduled {
            attempt: self.reconnect_attempt,
            delay,
        }));

        actions
    }

    /// Check that a frame may go out in the current state.
    ///
    /// Frames that need an authenticated socket (joins, broadcasts) set
    /// `require_auth`. Returns the send action for the driver.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::NotConnected` if the socket cannot carry the frame
    pub fn send(
        &self,
        frame: ClientFrame,
        require_auth: bool,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let allowed = match self.state {
            ConnectionState::Authenticated => true,
            ConnectionState::Open | ConnectionState::Authenticating => !require_auth,
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Closing => false,
        };

        if !allowed {
            return Err(ConnectionError::NotConnected { state: self.state });
        }

        Ok(vec![ConnectionAction::SendFrame(frame)])
    }

    /// Close the socket and never reconnect. Idempotent.
    pub fn teardown(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        if !self.torn_down {
            tracing::info!(state = ?self.state, "connection teardown");
        }
        self.torn_down = true;
        self.connect_after_close = false;
        self.reconnect_at = None;
        self.auth_deadline = None;
        self.next_ping = None;
        self.pending_token = None;

        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Open
            | ConnectionState::Authenticating
            | ConnectionState::Authenticated => {
                self.transition(ConnectionState::Closing, &mut actions);
                actions.push(ConnectionAction::CloseTransport {
                    code: close_code::NORMAL,
                    reason: "teardown".to_string(),
                });
            },
            ConnectionState::Closing | ConnectionState::Disconnected => {},
        }

        actions
    }

    fn begin_attempt(&mut self) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let Some(token) = self.credentials.token().filter(|token| !token.is_empty()) else {
            tracing::warn!("no credential, staying disconnected");
            self.failure = Some(ConnectionError::NotAuthenticated);
            return Err(ConnectionError::NotAuthenticated);
        };

        self.pending_token = Some(token);
        self.reconnect_at = None;
        self.disposition = CloseDisposition::Retry;

        let mut actions = Vec::new();
        self.transition(ConnectionState::Connecting, &mut actions);
        actions.push(ConnectionAction::OpenTransport);
        Ok(actions)
    }

    fn fail_authentication(
        &mut self,
        reason: String,
        code: u16,
        actions: &mut Vec<ConnectionAction>,
    ) {
        let err = ConnectionError::AuthenticationFailed { reason: reason.clone() };
        tracing::warn!(%reason, code, "authentication failed");

        self.auth_deadline = None;
        self.next_ping = None;
        self.failure = Some(err.clone());
        self.disposition = CloseDisposition::Hold;
        self.transition(ConnectionState::Closing, actions);
        actions.push(ConnectionAction::CloseTransport { code, reason });
        actions.push(ConnectionAction::Emit(ConnectionEvent::Error(err)));
    }

    fn transition(&mut self, next: ConnectionState, actions: &mut Vec<ConnectionAction>) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?next, "connection state");
        self.state = next;
        actions.push(ConnectionAction::Emit(ConnectionEvent::StateChanged(next)));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future,
        ops::{Add, Sub},
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
    };

    use super::*;
    use crate::credential::{SharedCredential, StaticCredential};

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

    #[derive(Clone, Default)]
    struct TestEnv(Arc<AtomicU64>);

    impl Environment for TestEnv {
        type Instant = At;

        fn now(&self) -> At {
            At(Duration::from_millis(self.0.load(Ordering::SeqCst)))
        }

        fn sleep(&self, _duration: Duration) -> impl Future<Output = ()> + Send {
            future::ready(())
        }

        fn wall_clock_millis(&self) -> u64 {
            1_700_000_000_000 + self.0.load(Ordering::SeqCst)
        }
    }

    fn secs(n: u64) -> At {
        At(Duration::from_secs(n))
    }

    fn manager() -> ConnectionManager<TestEnv, StaticCredential> {
        ConnectionManager::new(
            TestEnv::default(),
            StaticCredential::new("token"),
            ConnectionConfig::default(),
        )
    }

    fn authenticated() -> ConnectionManager<TestEnv, StaticCredential> {
        let mut conn = manager();
        conn.connect().unwrap();
        conn.transport_opened(secs(0));
        conn.handle_frame(ServerFrame::AuthSuccess, secs(0));
        conn
    }

    fn emitted(actions: &[ConnectionAction]) -> Vec<&ConnectionEvent> {
        actions
            .iter()
            .filter_map(|action| match action {
                ConnectionAction::Emit(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn has_event(actions: &[ConnectionAction], wanted: &ConnectionEvent) -> bool {
        emitted(actions).into_iter().any(|event| event == wanted)
    }

    #[test]
    fn connect_opens_transport() {
        let mut conn = manager();
        let actions = conn.connect().unwrap();

        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(actions.contains(&ConnectionAction::OpenTransport));
    }

    #[test]
    fn connect_is_noop_while_active() {
        let mut conn = authenticated();
        assert!(conn.connect().unwrap().is_empty());
        assert_eq!(conn.state(), ConnectionState::Authenticated);
    }

    #[test]
    fn connect_without_credential_fails() {
        let mut conn = ConnectionManager::new(
            TestEnv::default(),
            StaticCredential::none(),
            ConnectionConfig::default(),
        );

        assert_eq!(conn.connect(), Err(ConnectionError::NotAuthenticated));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn open_sends_auth_first() {
        let mut conn = manager();
        conn.connect().unwrap();
        let actions = conn.transport_opened(secs(0));

        let frames: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::SendFrame(f) => Some(f.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![ClientFrame::Auth { token: "token".into() }]);
        assert_eq!(conn.state(), ConnectionState::Authenticating);
        assert_eq!(conn.next_deadline(), Some(secs(10)));
    }

    #[test]
    fn auth_success_authenticates_and_resets_attempts() {
        let mut conn = manager();
        conn.connect().unwrap();
        conn.transport_closed(None, false, secs(0));
        assert_eq!(conn.reconnect_attempt(), 1);

        conn.tick(secs(1));
        conn.transport_opened(secs(1));
        let actions = conn.handle_frame(ServerFrame::AuthSuccess, secs(1));

        assert!(conn.is_authenticated());
        assert_eq!(conn.reconnect_attempt(), 0);
        assert!(has_event(&actions, &ConnectionEvent::Authenticated));
    }

    #[test]
    fn auth_timeout_closes_without_retry() {
        let mut conn = manager();
        conn.connect().unwrap();
        conn.transport_opened(secs(0));

        assert!(conn.tick(secs(9)).is_empty());

        let actions = conn.tick(secs(10));
        assert!(actions.iter().any(|a| matches!(
            a,
            ConnectionAction::CloseTransport { code: close_code::AUTH_TIMEOUT, .. }
        )));
        assert!(matches!(conn.failure(), Some(ConnectionError::AuthenticationFailed { .. })));

        let actions = conn.transport_closed(Some(close_code::AUTH_TIMEOUT), true, secs(10));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!emitted(&actions).iter().any(|e| matches!(e, ConnectionEvent::ReconnectScheduled { .. })));
        assert_eq!(conn.next_deadline(), None);
    }

    #[test]
    fn auth_error_frame_fails_authentication() {
        let mut conn = manager();
        conn.connect().unwrap();
        conn.transport_opened(secs(0));

        let actions = conn.handle_frame(ServerFrame::Error { message: "bad token".into() }, secs(1));
        let err = ConnectionError::AuthenticationFailed { reason: "bad token".into() };
        assert!(has_event(&actions, &ConnectionEvent::Error(err)));
        assert_eq!(conn.state(), ConnectionState::Closing);

        // Server closes abnormally; the failure is already surfaced so no retry.
        let actions = conn.transport_closed(None, false, secs(1));
        assert!(!emitted(&actions).iter().any(|e| matches!(e, ConnectionEvent::ReconnectScheduled { .. })));

        // An explicit connect is still allowed.
        assert!(conn.connect().is_ok());
    }

    #[test]
    fn error_frame_after_auth_is_not_fatal() {
        let mut conn = authenticated();
        let actions = conn.handle_frame(ServerFrame::Error { message: "slow down".into() }, secs(1));

        assert!(has_event(&actions, &ConnectionEvent::Error(ConnectionError::Server("slow down".into()))));
        assert!(conn.is_authenticated());
    }

    #[test]
    fn heartbeat_sends_ping_every_interval() {
        let mut conn = authenticated();

        assert!(conn.tick(secs(29)).is_empty());
        let actions = conn.tick(secs(30));
        assert!(matches!(actions.as_slice(), [ConnectionAction::SendFrame(ClientFrame::Ping { .. })]));

        assert!(conn.tick(secs(31)).is_empty());
        assert_eq!(conn.tick(secs(60)).len(), 1);
    }

    #[test]
    fn pong_records_ack() {
        let mut conn = authenticated();
        assert_eq!(conn.last_heartbeat_ack(), None);

        conn.handle_frame(ServerFrame::Pong, secs(31));
        assert_eq!(conn.last_heartbeat_ack(), Some(secs(31)));
    }

    #[test]
    fn unexpected_close_schedules_backoff() {
        let mut conn = authenticated();
        let actions = conn.transport_closed(Some(close_code::ABNORMAL), false, secs(5));

        assert!(has_event(&actions, &ConnectionEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(1),
        }));
        assert_eq!(conn.next_deadline(), Some(secs(6)));

        assert!(conn.tick(secs(5)).is_empty());
        let actions = conn.tick(secs(6));
        assert!(actions.contains(&ConnectionAction::OpenTransport));
    }

    #[test]
    fn clean_and_no_retry_closes_stay_down() {
        for (code, clean) in [
            (Some(close_code::NORMAL), true),
            (Some(close_code::GOING_AWAY), false),
            (Some(close_code::AUTH_REJECTED), false),
            (Some(1011), true),
        ] {
            let mut conn = authenticated();
            conn.transport_closed(code, clean, secs(1));
            assert_eq!(conn.next_deadline(), None, "code {code:?} clean {clean}");
            assert_eq!(conn.reconnect_attempt(), 0);
        }
    }

    #[test]
    fn backoff_doubles_then_gives_up() {
        let mut conn = manager();
        conn.connect().unwrap();

        let mut now = secs(0);
        let mut delays = Vec::new();
        loop {
            let actions = conn.transport_closed(None, false, now);
            let scheduled = emitted(&actions).into_iter().find_map(|e| match e {
                ConnectionEvent::ReconnectScheduled { delay, .. } => Some(*delay),
                _ => None,
            });
            let Some(delay) = scheduled else {
                assert!(has_event(&actions, &ConnectionEvent::Error(
                    ConnectionError::ConnectionFailedPermanently { attempts: 5 }
                )));
                break;
            };
            delays.push(delay);
            now = now + delay;
            conn.tick(now);
        }

        assert_eq!(delays, [1, 2, 4, 8].map(Duration::from_secs));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.next_deadline(), None);
    }

    #[test]
    fn manual_connect_after_giving_up_restores_backoff() {
        let mut conn = manager();
        conn.connect().unwrap();
        let mut now = secs(0);
        while conn.failure().is_none() {
            conn.transport_closed(None, false, now);
            now = now + Duration::from_secs(60);
            conn.tick(now);
        }
        assert_eq!(
            conn.failure(),
            Some(&ConnectionError::ConnectionFailedPermanently { attempts: 5 })
        );

        conn.connect().unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.failure(), None);
        assert_eq!(conn.reconnect_attempt(), 0);

        // Server still unreachable: the retry backs off instead of giving up.
        let actions = conn.transport_closed(None, false, now);
        assert!(has_event(&actions, &ConnectionEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(1),
        }));
        assert_eq!(conn.failure(), None);
    }

    #[test]
    fn connect_while_closing_starts_after_close() {
        let mut conn = manager();
        conn.connect().unwrap();
        conn.transport_opened(secs(0));
        conn.handle_frame(ServerFrame::Error { message: "expired".into() }, secs(1));
        assert_eq!(conn.state(), ConnectionState::Closing);

        assert!(conn.connect().unwrap().is_empty());
        assert_eq!(conn.state(), ConnectionState::Closing);

        let actions = conn.transport_closed(Some(close_code::AUTH_REJECTED), true, secs(1));
        assert!(actions.contains(&ConnectionAction::OpenTransport));
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.failure(), None);
    }

    #[test]
    fn backoff_delay_is_capped() {
        let config = ConnectionConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(5), Duration::from_secs(16));
        assert_eq!(config.backoff_delay(6), Duration::from_secs(30));
        assert_eq!(config.backoff_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn reconnect_reads_rotated_credential() {
        let cell = SharedCredential::new(Some("first".into()));
        let mut conn =
            ConnectionManager::new(TestEnv::default(), cell.clone(), ConnectionConfig::default());
        conn.connect().unwrap();
        conn.transport_opened(secs(0));
        conn.handle_frame(ServerFrame::AuthSuccess, secs(0));
        conn.transport_closed(None, false, secs(1));

        cell.set(Some("second".into()));
        conn.tick(secs(2));
        let actions = conn.transport_opened(secs(2));

        assert!(actions.contains(&ConnectionAction::SendFrame(ClientFrame::Auth {
            token: "second".into()
        })));
    }

    #[test]
    fn reconnect_without_credential_surfaces_error() {
        let cell = SharedCredential::new(Some("token".into()));
        let mut conn =
            ConnectionManager::new(TestEnv::default(), cell.clone(), ConnectionConfig::default());
        conn.connect().unwrap();
        conn.transport_closed(None, false, secs(0));

        cell.set(None);
        let actions = conn.tick(secs(1));

        assert!(has_event(&actions, &ConnectionEvent::Error(ConnectionError::NotAuthenticated)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.next_deadline(), None);
    }

    #[test]
    fn send_requires_authentication_for_joins() {
        let mut conn = manager();
        let join = ClientFrame::JoinConversation { conversation_id: ConversationId::new("1:2") };

        assert_eq!(
            conn.send(join.clone(), true),
            Err(ConnectionError::NotConnected { state: ConnectionState::Disconnected })
        );

        conn.connect().unwrap();
        conn.transport_opened(secs(0));
        assert!(conn.send(join.clone(), true).is_err());
        assert!(conn.send(ClientFrame::Ping { timestamp: 0 }, false).is_ok());

        conn.handle_frame(ServerFrame::AuthSuccess, secs(0));
        assert_eq!(conn.send(join.clone(), true), Ok(vec![ConnectionAction::SendFrame(join)]));
    }

    #[test]
    fn teardown_is_terminal() {
        let mut conn = authenticated();
        let actions = conn.teardown();

        assert!(actions.contains(&ConnectionAction::CloseTransport {
            code: close_code::NORMAL,
            reason: "teardown".into()
        }));
        assert_eq!(conn.state(), ConnectionState::Closing);

        let actions = conn.transport_closed(Some(close_code::NORMAL), true, secs(1));
        assert!(has_event(&actions, &ConnectionEvent::StateChanged(ConnectionState::Disconnected)));
        assert!(conn.teardown().is_empty());
        assert!(matches!(conn.connect(), Err(ConnectionError::InvalidState { .. })));
    }

    #[test]
    fn teardown_cancels_pending_reconnect() {
        let mut conn = authenticated();
        conn.transport_closed(None, false, secs(1));
        assert!(conn.next_deadline().is_some());

        conn.teardown();
        assert_eq!(conn.next_deadline(), None);
        assert!(conn.tick(secs(100)).is_empty());
    }

    #[test]
    fn messages_flow_only_while_open() {
        let mut conn = authenticated();
        let frame = ServerFrame::Message {
            conversation_id: ConversationId::new("1:2"),
            message: Message {
                id: courtside_proto::MessageId(1),
                sender_id: courtside_proto::UserId(2),
                receiver_id: courtside_proto::UserId(1),
                content: "yo".into(),
                created_at: None,
                timestamp: None,
                read: false,
            },
        };

        assert_eq!(emitted(&conn.handle_frame(frame.clone(), secs(1))).len(), 1);

        conn.transport_closed(None, false, secs(2));
        assert!(conn.handle_frame(frame, secs(2)).is_empty());
    }

    #[test]
    fn connected_greeting_records_client_id() {
        let mut conn = manager();
        conn.connect().unwrap();
        conn.transport_opened(secs(0));
        conn.handle_frame(ServerFrame::Connected { client_id: "c-17".into() }, secs(0));
        assert_eq!(conn.client_id(), Some("c-17"));
    }
}
