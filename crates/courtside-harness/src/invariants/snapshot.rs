//! Point-in-time captures of client state.
//!
//! Checks never touch a live session or view. Drivers copy out what a user
//! could observe (the rendered conversation, the channels they think they
//! hold, what the server recorded) and hand that to the registry.

use std::collections::BTreeSet;

use courtside_app::ViewSnapshot;
use courtside_core::Reconciler;
use courtside_proto::{ChannelId, Message, UserId};

/// Captured state of every simulated client.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// One entry per simulated user.
    pub clients: Vec<ClientSnapshot>,
}

impl SystemSnapshot {
    /// No clients at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Just one client.
    pub fn single(client: ClientSnapshot) -> Self {
        std::iter::once(client).collect()
    }

    /// Several clients, in the given order.
    pub fn from_clients(clients: impl IntoIterator<Item = ClientSnapshot>) -> Self {
        clients.into_iter().collect()
    }

    /// Client captured for `user`, if any.
    pub fn client(&self, user: UserId) -> Option<&ClientSnapshot> {
        self.clients.iter().find(|client| client.user == user)
    }
}

impl FromIterator<ClientSnapshot> for SystemSnapshot {
    fn from_iter<T: IntoIterator<Item = ClientSnapshot>>(iter: T) -> Self {
        Self { clients: iter.into_iter().collect() }
    }
}

/// Snapshot of a single client's observable state.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    /// Signed-in user.
    pub user: UserId,
    /// Open conversation partner. `None` if no conversation is open.
    pub counterpart: Option<UserId>,
    /// Conversation cache in presentation order.
    pub messages: Vec<Message>,
    /// Channels the client believes it holds.
    pub local_channels: BTreeSet<ChannelId>,
    /// Channels the server recorded for this client. `None` when unknown.
    pub server_channels: Option<BTreeSet<ChannelId>>,
    /// The socket is authenticated.
    pub authenticated: bool,
}

impl ClientSnapshot {
    /// Create an empty snapshot for `user`.
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            counterpart: None,
            messages: Vec::new(),
            local_channels: BTreeSet::new(),
            server_channels: None,
            authenticated: false,
        }
    }

    /// Capture the conversation held by a reconciler.
    pub fn from_reconciler(reconciler: &Reconciler) -> Self {
        Self {
            counterpart: reconciler.pair().map(|p| p.counterpart),
            messages: reconciler.messages(),
            ..Self::new(reconciler.local_user())
        }
    }

    /// Capture a rendered conversation view.
    pub fn from_view(user: UserId, view: &ViewSnapshot) -> Self {
        Self {
            counterpart: view.counterpart,
            messages: view.messages.clone(),
            authenticated: view.authenticated,
            ..Self::new(user)
        }
    }

    /// Set local membership.
    #[must_use]
    pub fn with_local_channels(mut self, channels: impl IntoIterator<Item = ChannelId>) -> Self {
        self.local_channels.extend(channels);
        self
    }

    /// Set the server's record of this client's membership.
    #[must_use]
    pub fn with_server_channels(mut self, channels: BTreeSet<ChannelId>) -> Self {
        self.server_channels = Some(channels);
        self
    }
}
