//! Standard conversation-layer checks.

use std::collections::HashSet;

use super::{ClientSnapshot, Invariant};

/// Every message id appears at most once in a conversation cache.
///
/// Socket deliveries, own-send results and reload merges all feed the same
/// cache. A second entry for one id means a merge path skipped the dedup.
pub struct NoDuplicateMessages;

impl Invariant for NoDuplicateMessages {
    fn name(&self) -> &'static str {
        "no_duplicate_messages"
    }

    fn check_client(&self, client: &ClientSnapshot) -> Result<(), String> {
        let mut seen = HashSet::with_capacity(client.messages.len());
        match client.messages.iter().find(|m| !seen.insert(m.id)) {
            Some(message) => Err(format!("message {} cached twice", message.id)),
            None => Ok(()),
        }
    }
}

/// Timestamped messages are in non-decreasing send order.
///
/// Messages without a timestamp are skipped; they sort by arrival.
pub struct ChronologicalOrder;

impl Invariant for ChronologicalOrder {
    fn name(&self) -> &'static str {
        "chronological_order"
    }

    fn check_client(&self, client: &ClientSnapshot) -> Result<(), String> {
        let timed: Vec<_> =
            client.messages.iter().filter_map(|m| m.sent_at().map(|at| (m.id, at))).collect();
        match timed.windows(2).find(|pair| pair[1].1 < pair[0].1) {
            Some(pair) => {
                let ((earlier_id, earlier), (later_id, later)) = (pair[0], pair[1]);
                Err(format!("message {later_id} at {later} follows {earlier_id} at {earlier}"))
            },
            None => Ok(()),
        }
    }
}

/// A cache only holds messages of the open conversation.
///
/// With no conversation open the cache is empty. Otherwise every message is
/// between the signed-in user and the counterpart, in either direction.
pub struct ConversationIsolation;

impl Invariant for ConversationIsolation {
    fn name(&self) -> &'static str {
        "conversation_isolation"
    }

    fn check_client(&self, client: &ClientSnapshot) -> Result<(), String> {
        let foreign = match client.counterpart {
            Some(counterpart) => {
                client.messages.iter().find(|m| !m.is_between(client.user, counterpart))
            },
            None => client.messages.first(),
        };
        match foreign {
            Some(message) => Err(format!(
                "viewing {:?} but holds message {} ({} -> {})",
                client.counterpart, message.id, message.sender_id, message.receiver_id
            )),
            None => Ok(()),
        }
    }
}

/// Once authenticated, the server's membership equals the local one.
///
/// Only checked for clients that are authenticated and whose server-side
/// membership is known.
pub struct MembershipConvergence;

impl Invariant for MembershipConvergence {
    fn name(&self) -> &'static str {
        "membership_convergence"
    }

    fn check_client(&self, client: &ClientSnapshot) -> Result<(), String> {
        let Some(server) = client.server_channels.as_ref().filter(|_| client.authenticated) else {
            return Ok(());
        };
        if *server == client.local_channels {
            return Ok(());
        }
        let missing: Vec<_> = client.local_channels.difference(server).collect();
        let stale: Vec<_> = server.difference(&client.local_channels).collect();
        Err(format!("server is missing {missing:?} and still holds {stale:?}"))
    }
}
