//! Synchronous session driver for property tests.
//!
//! `SimDriver` executes a [`Session`]'s transport commands against a
//! [`SimServer`] and feeds the server's replies back until both sides are
//! quiet. Time is a virtual offset moved only by [`SimDriver::advance`], so
//! one call sequence always produces the same trace. It mirrors what
//! [`courtside_app::Runtime`] does with a real socket, without a task or an
//! executor.

use std::time::Duration;

use courtside_app::{Session, SessionEvent, TransportCommand, TransportEvent};
use courtside_core::{ConnectionConfig, ConnectionError, CredentialProvider};
use courtside_proto::{ChannelId, UserId};
use tokio::{sync::mpsc, time::Instant};

use crate::{ClientSnapshot, SimEnv, SimServer};

/// Upper bound on command batches and inbound events per pump. A session
/// that keeps producing work past this is looping.
const MAX_ROUNDS: usize = 10_000;

/// Session wired to a simulated server.
pub struct SimDriver<C: CredentialProvider> {
    session: Session<SimEnv, C>,
    server: SimServer,
    env: SimEnv,
    elapsed: Duration,
    socket: Option<(u64, mpsc::UnboundedReceiver<TransportEvent>)>,
    events: Vec<SessionEvent>,
}

impl<C: CredentialProvider> SimDriver<C> {
    /// Driver for a session with `credentials` against `server`.
    pub fn new(server: SimServer, credentials: C, config: ConnectionConfig) -> Self {
        let env = SimEnv::new();
        Self {
            session: Session::new(env, credentials, config),
            server,
            env,
            elapsed: Duration::ZERO,
            socket: None,
            events: Vec::new(),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Instant {
        self.env.at(self.elapsed)
    }

    /// Driven session.
    pub fn session(&self) -> &Session<SimEnv, C> {
        &self.session
    }

    /// Server this driver talks to.
    pub fn server(&self) -> &SimServer {
        &self.server
    }

    /// True while a simulated socket is open.
    pub fn has_socket(&self) -> bool {
        self.socket.is_some()
    }

    /// Session events collected since the last call.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Start connecting and run until quiet.
    pub fn connect(&mut self) -> Result<(), ConnectionError> {
        let events = self.session.connect()?;
        self.events.extend(events);
        self.pump();
        Ok(())
    }

    /// Hold `channel` and run until quiet.
    pub fn join(&mut self, channel: ChannelId) {
        self.session.join(channel);
        self.pump();
    }

    /// Release `channel` and run until quiet.
    pub fn leave(&mut self, channel: &ChannelId) {
        self.session.leave(channel);
        self.pump();
    }

    /// Move virtual time forward, fire due timers and run until quiet.
    pub fn advance(&mut self, by: Duration) {
        self.elapsed += by;
        let events = self.session.handle_tick(self.now());
        self.events.extend(events);
        self.pump();
    }

    /// Advance in `step`s until the session is authenticated or `limit`
    /// has passed. Returns whether it authenticated.
    pub fn run_until_authenticated(&mut self, step: Duration, limit: Duration) -> bool {
        let deadline = self.elapsed + limit;
        while !self.session.status().authenticated && self.elapsed < deadline {
            self.advance(step);
        }
        self.session.status().authenticated
    }

    /// Close the session for good.
    pub fn teardown(&mut self) {
        let events = self.session.teardown();
        self.events.extend(events);
        self.pump();
    }

    /// Snapshot of local and server-side membership for `user`.
    pub fn snapshot(&self, user: UserId) -> ClientSnapshot {
        let status = self.session.status();
        let mut snapshot = ClientSnapshot::new(user)
            .with_local_channels(self.session.subscriptions().channels().cloned());
        snapshot.authenticated = status.authenticated;
        if status.authenticated {
            snapshot.server_channels = Some(self.server.joined_channels(user));
        }
        snapshot
    }

    /// Execute outgoing commands and deliver inbound frames until neither
    /// side has work left.
    ///
    /// Like the runtime, every inbound event is followed by a flush of the
    /// commands it produced before the next event is read.
    pub fn pump(&mut self) {
        for _ in 0..MAX_ROUNDS {
            let commands = self.session.take_outgoing();
            if !commands.is_empty() {
                for command in commands {
                    self.execute(command);
                }
                continue;
            }

            match self.next_inbound() {
                Some(event) => self.deliver(event),
                None => return,
            }
        }
        tracing::warn!(rounds = MAX_ROUNDS, "sim driver did not settle");
    }

    fn execute(&mut self, command: TransportCommand) {
        let now = self.now();
        match command {
            TransportCommand::Open => match self.server.accept() {
                Some(socket) => {
                    if let Some((stale, _)) = self.socket.replace(socket) {
                        self.server.disconnect(stale);
                    }
                    let events = self.session.transport_opened(now);
                    self.events.extend(events);
                },
                None => self.failed("server unreachable"),
            },
            TransportCommand::Send(frame) => {
                let Some((id, _)) = &self.socket else {
                    tracing::trace!(kind = frame.kind(), "no socket, dropping frame");
                    return;
                };
                let delivered = frame.encode().is_ok_and(|text| self.server.receive(*id, &text));
                if !delivered {
                    self.failed("socket closed by server");
                }
            },
            TransportCommand::Close { code, .. } => {
                if let Some((id, _)) = self.socket.take() {
                    self.server.disconnect(id);
                }
                let events = self.session.transport_closed(Some(code), true, now);
                self.events.extend(events);
            },
        }
    }

    fn deliver(&mut self, event: TransportEvent) {
        let now = self.now();
        let events = match event {
            TransportEvent::Text(text) => self.session.handle_text(&text, now),
            TransportEvent::Closed { code, was_clean } => {
                self.socket = None;
                self.session.transport_closed(code, was_clean, now)
            },
        };
        self.events.extend(events);
    }

    fn failed(&mut self, reason: &str) {
        self.socket = None;
        let now = self.now();
        let mut events = self.session.transport_error(reason);
        events.extend(self.session.transport_closed(None, false, now));
        self.events.extend(events);
    }

    fn next_inbound(&mut self) -> Option<TransportEvent> {
        let (_, inbox) = self.socket.as_mut()?;
        inbox.try_recv().ok()
    }
}
