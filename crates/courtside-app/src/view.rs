//! Conversation view model.
//!
//! The façade a presentation layer binds to. Pure state machine: consumes
//! [`ViewEvent`]s and produces [`ViewAction`]s for the runtime to execute.
//!
//! # Responsibilities
//!
//! - Joins the conversation channel while mounted and leaves it on unmount or
//!   counterpart change.
//! - Reloads from the store on mount, after every re-authentication, and on a
//!   fixed poll interval as a backstop for broadcasts lost in reconnect gaps.
//! - Validates sends and, once the durable write succeeds, inserts the stored
//!   record and asks for a socket broadcast.
//! - Issues mark-read for counterpart messages that become visible.

use std::{fmt, time::Duration};

use courtside_core::{MergeOutcome, MonotonicInstant, Reconciler, ReloadOutcome, ReloadTicket};
use courtside_proto::{ChannelId, ConversationId, Message, NewMessage, UserId};

use crate::{ChatError, StoreError};

/// Default interval between background reloads.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Identifier of a mounted view within one runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// View configuration
#[derive(Debug, Clone)]
pub struct ViewConfig {
    /// Background reload interval. `None` disables polling.
    pub poll_interval: Option<Duration>,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self { poll_interval: Some(DEFAULT_POLL_INTERVAL) }
    }
}

/// Inputs of the view state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    /// View became visible.
    Mount {
        /// Conversation partner, if already known.
        counterpart: Option<UserId>,
    },

    /// The conversation partner changed.
    SwitchCounterpart {
        /// New partner. `None` clears the conversation.
        counterpart: Option<UserId>,
    },

    /// View went away.
    Unmount,

    /// Socket status changed.
    ConnectionChanged {
        /// A socket is open.
        connected: bool,
        /// The socket is authenticated.
        authenticated: bool,
    },

    /// Connection-level failure worth showing.
    ConnectionFailed {
        /// Human readable reason.
        reason: String,
    },

    /// Broadcast received on a joined channel.
    Broadcast {
        /// Channel the message arrived on.
        conversation_id: ConversationId,
        /// Message record.
        message: Message,
    },

    /// A store fetch finished.
    ReloadCompleted {
        /// Ticket the fetch was issued with.
        ticket: ReloadTicket,
        /// Fetched messages or the failure.
        result: Result<Vec<Message>, StoreError>,
    },

    /// Periodic tick.
    Tick,
}

/// Actions produced by the view state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewAction {
    /// Hold a channel.
    Join(ChannelId),

    /// Release a channel.
    Leave(ChannelId),

    /// Fetch the conversation from the store.
    Reload(ReloadTicket),

    /// Broadcast a persisted message over the socket.
    Broadcast {
        /// Channel to broadcast on.
        conversation_id: ConversationId,
        /// Persisted record.
        message: Message,
    },

    /// Fire-and-forget mark-read for messages from `counterpart`.
    MarkRead {
        /// Author of the messages to mark.
        counterpart: UserId,
    },

    /// Presentation state changed.
    Render,
}

/// Presentation state of a view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewSnapshot {
    /// Conversation partner.
    pub counterpart: Option<UserId>,
    /// Ordered messages of the conversation.
    pub messages: Vec<Message>,
    /// A socket is open.
    pub connected: bool,
    /// The socket is authenticated.
    pub authenticated: bool,
    /// Last error worth showing.
    pub last_error: Option<String>,
}

/// Conversation view state machine.
///
/// Pure state machine that processes events and produces actions.
/// No I/O dependencies - fully testable in simulation.
#[derive(Debug, Clone)]
pub struct ConversationView<I: MonotonicInstant> {
    config: ViewConfig,
    reconciler: Reconciler,
    mounted: bool,
    connected: bool,
    authenticated: bool,
    last_error: Option<String>,
    next_poll: Option<I>,
}

impl<I: MonotonicInstant> ConversationView<I> {
    /// Unmounted view for the signed-in user `local`.
    pub fn new(local: UserId, config: ViewConfig) -> Self {
        Self {
            config,
            reconciler: Reconciler::new(local),
            mounted: false,
            connected: false,
            authenticated: false,
            last_error: None,
            next_poll: None,
        }
    }

    /// Process an event and return actions.
    pub fn handle(&mut self, event: ViewEvent, now: I) -> Vec<ViewAction> {
        let mut actions = Vec::new();

        match event {
            ViewEvent::Mount { counterpart } | ViewEvent::SwitchCounterpart { counterpart } => {
                let changed = !self.mounted || counterpart != self.counterpart();
                self.mounted = true;
                if changed {
                    self.close_conversation(&mut actions);
                    if let Some(counterpart) = counterpart {
                        self.open_conversation(counterpart, now, &mut actions);
                    }
                    actions.push(ViewAction::Render);
                }
            },
            ViewEvent::Unmount => {
                self.close_conversation(&mut actions);
                self.mounted = false;
            },
            ViewEvent::ConnectionChanged { connected, authenticated } => {
                let reauthenticated = authenticated && !self.authenticated;
                let changed = connected != self.connected || authenticated != self.authenticated;
                self.connected = connected;
                self.authenticated = authenticated;

                if reauthenticated && let Some(ticket) = self.active_ticket() {
                    actions.push(ViewAction::Reload(ticket));
                }
                if changed && self.mounted {
                    actions.push(ViewAction::Render);
                }
            },
            ViewEvent::ConnectionFailed { reason } => {
                if self.mounted {
                    self.last_error = Some(reason);
                    actions.push(ViewAction::Render);
                }
            },
            ViewEvent::Broadcast { conversation_id, message } => {
                if self.mounted {
                    self.apply_broadcast(&conversation_id, message, &mut actions);
                }
            },
            ViewEvent::ReloadCompleted { ticket, result } => {
                self.apply_reload(ticket, result, &mut actions);
            },
            ViewEvent::Tick => {
                if self.next_poll.is_some_and(|due| now >= due)
                    && let Some(ticket) = self.active_ticket()
                {
                    actions.push(ViewAction::Reload(ticket));
                    self.next_poll = self.config.poll_interval.map(|interval| now + interval);
                }
            },
        }

        actions
    }

    /// Validate a send and build the durable write request.
    ///
    /// # Errors
    ///
    /// - `ChatError::EmptyContent` if `content` is blank
    /// - `ChatError::NoCounterpart` if no conversation is open
    pub fn send(&self, content: &str) -> Result<NewMessage, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let counterpart = self.counterpart().ok_or(ChatError::NoCounterpart)?;
        Ok(NewMessage { receiver_id: counterpart, content: content.to_string() })
    }

    /// Apply the outcome of a durable write started by [`Self::send`].
    ///
    /// On success the stored record is inserted immediately and a broadcast
    /// is requested. On failure nothing is broadcast and the content is
    /// handed back inside the error.
    pub fn send_completed(
        &mut self,
        content: String,
        result: Result<Message, StoreError>,
    ) -> (Vec<ViewAction>, Result<Message, ChatError>) {
        match result {
            Ok(message) => {
                let outcome = self.reconciler.apply_sent(message.clone());
                tracing::debug!(id = %message.id, ?outcome, "durable write applied");
                self.last_error = None;

                let actions = vec![
                    ViewAction::Broadcast {
                        conversation_id: message.conversation_id(),
                        message: message.clone(),
                    },
                    ViewAction::Render,
                ];
                (actions, Ok(message))
            },
            Err(source) => {
                tracing::warn!(error = %source, "durable write failed");
                let err = ChatError::DurableWriteFailed { content, source };
                self.last_error = Some(err.to_string());
                (vec![ViewAction::Render], Err(err))
            },
        }
    }

    /// Messages of the open conversation in display order.
    pub fn messages(&self) -> Vec<Message> {
        self.reconciler.messages()
    }

    /// Conversation partner, if a conversation is open.
    pub fn counterpart(&self) -> Option<UserId> {
        self.reconciler.pair().map(|pair| pair.counterpart)
    }

    /// True while mounted.
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// A socket is open.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The socket is authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Last error worth showing.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Reconciler of this view.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Next background reload.
    pub fn next_poll(&self) -> Option<I> {
        self.next_poll
    }

    /// Presentation state.
    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            counterpart: self.counterpart(),
            messages: self.messages(),
            connected: self.connected,
            authenticated: self.authenticated,
            last_error: self.last_error.clone(),
        }
    }

    fn active_ticket(&self) -> Option<ReloadTicket> {
        if self.mounted { self.reconciler.reload_ticket() } else { None }
    }

    fn open_conversation(&mut self, counterpart: UserId, now: I, actions: &mut Vec<ViewAction>) {
        let ticket = self.reconciler.open(counterpart);
        actions.push(ViewAction::Join(ChannelId::from(ticket.pair().conversation_id())));
        actions.push(ViewAction::Reload(ticket));
        self.next_poll = self.config.poll_interval.map(|interval| now + interval);
        self.last_error = None;
    }

    fn close_conversation(&mut self, actions: &mut Vec<ViewAction>) {
        if let Some(pair) = self.reconciler.pair() {
            actions.push(ViewAction::Leave(ChannelId::from(pair.conversation_id())));
        }
        self.reconciler.close();
        self.next_poll = None;
    }

    fn apply_broadcast(
        &mut self,
        conversation_id: &ConversationId,
        message: Message,
        actions: &mut Vec<ViewAction>,
    ) {
        let sender = message.sender_id;
        let id = message.id;

        match self.reconciler.apply_broadcast(conversation_id, message) {
            MergeOutcome::Inserted => {
                self.reconciler.mark_counterpart_read();
                actions.push(ViewAction::MarkRead { counterpart: sender });
                actions.push(ViewAction::Render);
            },
            outcome => {
                tracing::trace!(%id, %conversation_id, ?outcome, "broadcast not inserted");
            },
        }
    }

    fn apply_reload(
        &mut self,
        ticket: ReloadTicket,
        result: Result<Vec<Message>, StoreError>,
        actions: &mut Vec<ViewAction>,
    ) {
        let current = self.active_ticket() == Some(ticket);

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::warn!(counterpart = %ticket.counterpart(), error = %err, "reload failed");
                if current {
                    self.last_error = Some(format!("could not load messages: {err}"));
                    actions.push(ViewAction::Render);
                }
                return;
            },
        };

        if !current {
            tracing::debug!(counterpart = %ticket.counterpart(), "discarding reload for closed view");
            return;
        }

        match self.reconciler.apply_reload(ticket, fetched) {
            ReloadOutcome::Merged { added } => {
                let counterpart = ticket.counterpart();
                let unread = self.reconciler.cache().is_some_and(|cache| {
                    cache.messages().any(|m| m.sender_id == counterpart && !m.read)
                });
                if unread {
                    self.reconciler.mark_counterpart_read();
                    actions.push(ViewAction::MarkRead { counterpart });
                }
                if added > 0 || unread {
                    actions.push(ViewAction::Render);
                }
            },
            ReloadOutcome::Stale => {},
        }
    }
}
