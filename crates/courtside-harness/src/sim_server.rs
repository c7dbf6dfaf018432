//! Conversation socket server model.
//!
//! `SimServer` plays the server side of the socket protocol for any number of
//! simulated sockets. It authenticates, records joined channels per socket,
//! answers pings and rebroadcasts `message` frames to every socket joined to
//! the conversation, the sender included.
//!
//! Tests drive outages through [`SimServer::drop_all`] and
//! [`SimServer::set_reachable`], and read the server-side membership with
//! [`SimServer::joined_channels`].

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use courtside_app::TransportEvent;
use courtside_proto::{ChannelId, ClientFrame, ConversationId, Message, ServerFrame, UserId};
use tokio::sync::mpsc;

use crate::lock;

/// How the server answers `auth` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Accept registered tokens, reject others.
    #[default]
    Verify,
    /// Reject every token.
    Reject,
    /// Never answer.
    Silent,
}

struct SocketState {
    user: Option<UserId>,
    channels: BTreeSet<ChannelId>,
    inbox: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct ServerState {
    tokens: HashMap<String, UserId>,
    sockets: BTreeMap<u64, SocketState>,
    next_socket: u64,
    unreachable: bool,
    auth_mode: AuthMode,
    accepted: usize,
    received: Vec<(u64, ClientFrame)>,
}

/// Shared handle to one simulated server.
#[derive(Clone, Default)]
pub struct SimServer {
    state: Arc<Mutex<ServerState>>,
}

impl SimServer {
    /// Server with no registered users.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `user`.
    pub fn register(&self, token: impl Into<String>, user: UserId) {
        lock(&self.state).tokens.insert(token.into(), user);
    }

    /// Refuse new sockets while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).unreachable = !reachable;
    }

    /// Change how `auth` frames are answered.
    pub fn set_auth_mode(&self, mode: AuthMode) {
        lock(&self.state).auth_mode = mode;
    }

    /// Accept a socket. Returns its id and the receiving end of its inbox.
    ///
    /// The `connected` greeting is queued immediately. Returns `None` while
    /// the server is unreachable.
    pub fn accept(&self) -> Option<(u64, mpsc::UnboundedReceiver<TransportEvent>)> {
        let mut state = lock(&self.state);
        if state.unreachable {
            return None;
        }

        state.next_socket += 1;
        state.accepted += 1;
        let id = state.next_socket;
        let (inbox, rx) = mpsc::unbounded_channel();

        let greeting = ServerFrame::Connected { client_id: format!("sim-{id}") };
        push(&inbox, &greeting);
        state.sockets.insert(id, SocketState { user: None, channels: BTreeSet::new(), inbox });

        tracing::debug!(socket = id, "sim socket accepted");
        Some((id, rx))
    }

    /// Handle one text frame from `socket`. Returns `false` if the socket is
    /// gone.
    pub fn receive(&self, socket: u64, text: &str) -> bool {
        let mut state = lock(&self.state);
        if !state.sockets.contains_key(&socket) {
            return false;
        }

        let frame = match ClientFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                reply(&state, socket, &ServerFrame::Error { message: err.to_string() });
                return true;
            },
        };
        state.received.push((socket, frame.clone()));

        match frame {
            ClientFrame::Auth { token } => {
                let user = match state.auth_mode {
                    AuthMode::Silent => return true,
                    AuthMode::Reject => None,
                    AuthMode::Verify => state.tokens.get(&token).copied(),
                };
                match user {
                    Some(user) => {
                        if let Some(entry) = state.sockets.get_mut(&socket) {
                            entry.user = Some(user);
                        }
                        reply(&state, socket, &ServerFrame::AuthSuccess);
                    },
                    None => {
                        reply(&state, socket, &ServerFrame::Error {
                            message: "invalid token".into(),
                        });
                    },
                }
            },
            ClientFrame::JoinConversation { conversation_id } => {
                membership(&mut state, socket, ChannelId::Conversation(conversation_id), true);
            },
            ClientFrame::SubscribeFacility { facility_id } => {
                membership(&mut state, socket, ChannelId::Facility(facility_id), true);
            },
            ClientFrame::LeaveConversation { conversation_id } => {
                membership(&mut state, socket, ChannelId::Conversation(conversation_id), false);
            },
            ClientFrame::UnsubscribeFacility { facility_id } => {
                membership(&mut state, socket, ChannelId::Facility(facility_id), false);
            },
            ClientFrame::Message { conversation_id, message } => {
                if authenticated(&state, socket) {
                    broadcast_in(&state, conversation_id, message);
                } else {
                    reply(&state, socket, &ServerFrame::Error {
                        message: "not authenticated".into(),
                    });
                }
            },
            ClientFrame::Ping { .. } => reply(&state, socket, &ServerFrame::Pong),
        }
        true
    }

    /// Client-initiated close of `socket`.
    pub fn disconnect(&self, socket: u64) {
        if lock(&self.state).sockets.remove(&socket).is_some() {
            tracing::debug!(socket, "sim socket closed by client");
        }
    }

    /// Server-side close of every socket, as in an outage or a deploy.
    ///
    /// `code` of `None` models a dropped connection with no close frame.
    pub fn drop_all(&self, code: Option<u16>) {
        let sockets = std::mem::take(&mut lock(&self.state).sockets);
        for (id, socket) in sockets {
            let event = TransportEvent::Closed { code, was_clean: code.is_some() };
            if socket.inbox.send(event).is_err() {
                tracing::trace!(socket = id, "inbox already dropped");
            }
        }
    }

    /// Deliver `message` to every socket joined to `conversation_id`, as if
    /// another client had broadcast it.
    pub fn broadcast(&self, conversation_id: ConversationId, message: Message) {
        broadcast_in(&lock(&self.state), conversation_id, message);
    }

    /// Send an arbitrary frame to every open socket.
    pub fn push_all(&self, frame: &ServerFrame) {
        let state = lock(&self.state);
        for socket in state.sockets.values() {
            push(&socket.inbox, frame);
        }
    }

    /// Channels joined by `user`'s authenticated sockets.
    pub fn joined_channels(&self, user: UserId) -> BTreeSet<ChannelId> {
        lock(&self.state)
            .sockets
            .values()
            .filter(|s| s.user == Some(user))
            .flat_map(|s| s.channels.iter().cloned())
            .collect()
    }

    /// True if `user` has an authenticated socket.
    pub fn is_online(&self, user: UserId) -> bool {
        lock(&self.state).sockets.values().any(|s| s.user == Some(user))
    }

    /// Number of open sockets.
    pub fn open_sockets(&self) -> usize {
        lock(&self.state).sockets.len()
    }

    /// Number of sockets accepted since creation.
    pub fn accepted(&self) -> usize {
        lock(&self.state).accepted
    }

    /// Every client frame received so far, with its socket id.
    pub fn received(&self) -> Vec<(u64, ClientFrame)> {
        lock(&self.state).received.clone()
    }
}

fn push(inbox: &mpsc::UnboundedSender<TransportEvent>, frame: &ServerFrame) {
    match frame.encode() {
        Ok(text) => {
            if inbox.send(TransportEvent::Text(text)).is_err() {
                tracing::trace!(kind = frame.kind(), "inbox dropped");
            }
        },
        Err(err) => tracing::warn!(error = %err, "sim server could not encode frame"),
    }
}

fn reply(state: &ServerState, socket: u64, frame: &ServerFrame) {
    if let Some(entry) = state.sockets.get(&socket) {
        push(&entry.inbox, frame);
    }
}

fn authenticated(state: &ServerState, socket: u64) -> bool {
    state.sockets.get(&socket).is_some_and(|s| s.user.is_some())
}

fn membership(state: &mut ServerState, socket: u64, channel: ChannelId, join: bool) {
    if !authenticated(state, socket) {
        reply(state, socket, &ServerFrame::Error { message: "not authenticated".into() });
        return;
    }
    if let Some(entry) = state.sockets.get_mut(&socket) {
        if join {
            entry.channels.insert(channel);
        } else {
            entry.channels.remove(&channel);
        }
    }
}

fn broadcast_in(state: &ServerState, conversation_id: ConversationId, message: Message) {
    let channel = ChannelId::Conversation(conversation_id.clone());
    let frame = ServerFrame::Message { conversation_id, message };
    for socket in state.sockets.values().filter(|s| s.channels.contains(&channel)) {
        push(&socket.inbox, &frame);
    }
}
