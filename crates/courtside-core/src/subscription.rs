//! Declarative channel membership.
//!
//! The server forgets every join when a socket drops, so membership is owned
//! here and re-asserted after each successful authentication. Several views
//! may hold the same channel; the tracker counts holders so the leave frame
//! goes out only when the last one lets go.
//!
//! # Invariants
//!
//! - After any `auth_success`, exactly one join frame is produced per held
//!   channel, before any broadcast for that session.
//! - A channel whose holder count reaches zero is forgotten immediately.

use std::collections::BTreeMap;

use courtside_proto::{ChannelId, ClientFrame};

/// Refcounted set of joined channels.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTracker {
    holders: BTreeMap<ChannelId, usize>,
}

impl SubscriptionTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a holder for `channel`.
    ///
    /// Returns the join frame to send now, if this is the first holder and
    /// the socket is authenticated. Otherwise the join waits for
    /// [`Self::replay`].
    pub fn join(&mut self, channel: ChannelId, authenticated: bool) -> Option<ClientFrame> {
        let count = self.holders.entry(channel.clone()).or_insert(0);
        *count += 1;

        tracing::debug!(%channel, holders = *count, "channel join");
        (*count == 1 && authenticated).then(|| ClientFrame::join(&channel))
    }

    /// Release one holder of `channel`.
    ///
    /// Returns the leave frame when the last holder leaves and the socket is
    /// authenticated. Leaving a channel that is not held is a no-op.
    pub fn leave(&mut self, channel: &ChannelId, authenticated: bool) -> Option<ClientFrame> {
        let count = self.holders.get_mut(channel)?;
        *count -= 1;
        if *count > 0 {
            return None;
        }

        self.holders.remove(channel);
        tracing::debug!(%channel, "channel released");
        authenticated.then(|| ClientFrame::leave(channel))
    }

    /// Join frames for every held channel, in channel order.
    pub fn replay(&self) -> Vec<ClientFrame> {
        self.holders.keys().map(ClientFrame::join).collect()
    }

    /// True if at least one holder has `channel`.
    pub fn is_joined(&self, channel: &ChannelId) -> bool {
        self.holders.contains_key(channel)
    }

    /// Number of holders of `channel`.
    pub fn holders(&self, channel: &ChannelId) -> usize {
        self.holders.get(channel).copied().unwrap_or(0)
    }

    /// Held channels.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelId> {
        self.holders.keys()
    }

    /// Forget everything. Used at teardown.
    pub fn clear(&mut self) {
        self.holders.clear();
    }
}
