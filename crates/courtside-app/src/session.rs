//! Session-scoped connection bridge.
//!
//! The [`Session`] owns the single [`ConnectionManager`] and the
//! [`SubscriptionTracker`] of one signed-in user. Every conversation view
//! shares it, which keeps one socket per session no matter how many views are
//! mounted.
//!
//! # Responsibilities
//!
//! - Translates connection actions into [`TransportCommand`]s, accumulated for
//!   the driver to execute in the next I/O cycle.
//! - Replays channel joins after each successful authentication, before any
//!   other frame of that socket is processed.
//! - Decodes inbound text frames and converts connection events into
//!   [`SessionEvent`]s for the views.

use courtside_core::{
    ConnectionAction, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager,
    ConnectionState, CredentialProvider, Environment, SubscriptionTracker,
};
use courtside_proto::{ChannelId, ClientFrame, ConversationId, Message, ServerFrame};

/// Socket operations for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Open a new socket.
    Open,
    /// Write this frame.
    Send(ClientFrame),
    /// Close the socket.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Connection summary for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// A socket is open.
    pub connected: bool,
    /// The socket completed the auth handshake.
    pub authenticated: bool,
    /// Consecutive failed reconnect attempts.
    pub reconnect_attempt: u32,
    /// Failure that stopped automatic reconnection, if any.
    pub failure: Option<ConnectionError>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connected: false,
            authenticated: false,
            reconnect_attempt: 0,
            failure: None,
        }
    }
}

/// Events for conversation views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection status changed.
    StatusChanged(ConnectionStatus),
    /// Broadcast received on a joined channel.
    Message {
        /// Channel the message arrived on.
        conversation_id: ConversationId,
        /// Message record.
        message: Message,
    },
    /// Connection-level failure.
    Error(ConnectionError),
}

/// Bridge between connection state, channel membership, and the transport.
///
/// Generic over Environment to support both production and simulation.
pub struct Session<E: Environment, C: CredentialProvider> {
    connection: ConnectionManager<E, C>,
    subscriptions: SubscriptionTracker,
    outgoing: Vec<TransportCommand>,
}

impl<E: Environment, C: CredentialProvider> Session<E, C> {
    /// Create a disconnected session.
    pub fn new(env: E, credentials: C, config: ConnectionConfig) -> Self {
        Self {
            connection: ConnectionManager::new(env, credentials, config),
            subscriptions: SubscriptionTracker::new(),
            outgoing: Vec::new(),
        }
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.connection.state(),
            connected: self.connection.is_open(),
            authenticated: self.connection.is_authenticated(),
            reconnect_attempt: self.connection.reconnect_attempt(),
            failure: self.connection.failure().cloned(),
        }
    }

    /// Underlying connection manager.
    pub fn connection(&self) -> &ConnectionManager<E, C> {
        &self.connection
    }

    /// Channel membership.
    pub fn subscriptions(&self) -> &SubscriptionTracker {
        &self.subscriptions
    }

    /// Earliest instant at which [`Self::handle_tick`] has work.
    pub fn next_deadline(&self) -> Option<E::Instant> {
        self.connection.next_deadline()
    }

    /// Start connecting.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::NotAuthenticated` if no credential is available
    /// - `ConnectionError::InvalidState` after teardown
    pub fn connect(&mut self) -> Result<Vec<SessionEvent>, ConnectionError> {
        let actions = self.connection.connect()?;
        Ok(self.process_actions(actions))
    }

    /// Hold `channel`. Sends the join now if authenticated, else on the next
    /// authentication.
    pub fn join(&mut self, channel: ChannelId) {
        let authenticated = self.connection.is_authenticated();
        if let Some(frame) = self.subscriptions.join(channel, authenticated) {
            self.send_control(frame);
        }
    }

    /// Release `channel`. Never fails, even without a socket.
    pub fn leave(&mut self, channel: &ChannelId) {
        let authenticated = self.connection.is_authenticated();
        if let Some(frame) = self.subscriptions.leave(channel, authenticated) {
            self.send_control(frame);
        }
    }

    /// Broadcast a persisted message on its conversation channel.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::NotConnected` if the socket is not authenticated;
    ///   the broadcast is not queued
    pub fn broadcast(
        &mut self,
        conversation_id: ConversationId,
        message: Message,
    ) -> Result<(), ConnectionError> {
        let actions = self.connection.send(ClientFrame::Message { conversation_id, message }, true)?;
        self.process_actions(actions);
        Ok(())
    }

    /// Socket finished opening.
    pub fn transport_opened(&mut self, now: E::Instant) -> Vec<SessionEvent> {
        let actions = self.connection.transport_opened(now);
        self.process_actions(actions)
    }

    /// Text frame received.
    pub fn handle_text(&mut self, text: &str, now: E::Instant) -> Vec<SessionEvent> {
        match ServerFrame::decode(text) {
            Ok(frame) => {
                tracing::trace!(kind = frame.kind(), "frame received");
                let actions = self.connection.handle_frame(frame, now);
                self.process_actions(actions)
            },
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable frame");
                Vec::new()
            },
        }
    }

    /// Socket reported a failure.
    pub fn transport_error(&mut self, reason: impl Into<String>) -> Vec<SessionEvent> {
        let actions = self.connection.transport_error(reason);
        self.process_actions(actions)
    }

    /// Socket closed.
    pub fn transport_closed(
        &mut self,
        code: Option<u16>,
        was_clean: bool,
        now: E::Instant,
    ) -> Vec<SessionEvent> {
        let actions = self.connection.transport_closed(code, was_clean, now);
        self.process_actions(actions)
    }

    /// Process a time tick.
    pub fn handle_tick(&mut self, now: E::Instant) -> Vec<SessionEvent> {
        let actions = self.connection.tick(now);
        self.process_actions(actions)
    }

    /// Close the socket for good and forget all memberships.
    pub fn teardown(&mut self) -> Vec<SessionEvent> {
        self.subscriptions.clear();
        let actions = self.connection.teardown();
        self.process_actions(actions)
    }

    /// Take pending transport commands.
    pub fn take_outgoing(&mut self) -> Vec<TransportCommand> {
        std::mem::take(&mut self.outgoing)
    }

    fn send_control(&mut self, frame: ClientFrame) {
        match self.connection.send(frame, true) {
            Ok(actions) => {
                self.process_actions(actions);
            },
            // Replayed on the next authentication.
            Err(err) => tracing::debug!(error = %err, "control frame deferred"),
        }
    }

    fn process_actions(&mut self, actions: Vec<ConnectionAction>) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        for action in actions {
            match action {
                ConnectionAction::OpenTransport => self.outgoing.push(TransportCommand::Open),
                ConnectionAction::SendFrame(frame) => {
                    self.outgoing.push(TransportCommand::Send(frame));
                },
                ConnectionAction::CloseTransport { code, reason } => {
                    self.outgoing.push(TransportCommand::Close { code, reason });
                },
                ConnectionAction::Emit(ConnectionEvent::Authenticated) => {
                    let joins = self.subscriptions.replay();
                    tracing::info!(channels = joins.len(), "replaying channel joins");
                    self.outgoing.extend(joins.into_iter().map(TransportCommand::Send));
                },
                ConnectionAction::Emit(ConnectionEvent::StateChanged(_)) => {
                    events.push(SessionEvent::StatusChanged(self.status()));
                },
                ConnectionAction::Emit(ConnectionEvent::Message { conversation_id, message }) => {
                    events.push(SessionEvent::Message { conversation_id, message });
                },
                ConnectionAction::Emit(ConnectionEvent::Error(err)) => {
                    events.push(SessionEvent::Error(err));
                },
                ConnectionAction::Emit(ConnectionEvent::ReconnectScheduled { .. }) => {
                    events.push(SessionEvent::StatusChanged(self.status()));
                },
                ConnectionAction::Emit(
                    ConnectionEvent::Opened | ConnectionEvent::Closed { .. },
                ) => {},
            }
        }

        events
    }
}
