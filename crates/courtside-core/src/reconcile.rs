//! Message reconciliation.
//!
//! Three sources feed the open conversation: the result of the local durable
//! write, broadcasts on the socket, and periodic reloads from the store. They
//! race, so the same message can arrive up to three times and in any order.
//! The reconciler keeps one list per conversation that is free of duplicates,
//! sorted by creation time, and restricted to the conversation's two users.
//!
//! # Components
//!
//! - [`ConversationCache`]: ordered, id-indexed message list for one pair
//! - [`merge_reload`]: pure union of a cache with a store fetch
//! - [`Reconciler`]: owns the cache of the open conversation and discards
//!   reloads that complete after the user switched away
//!
//! # Invariants
//!
//! - Every [`MessageId`] appears at most once.
//! - Iteration order is non-decreasing by effective creation time, ties in
//!   arrival order. A record without a timestamp inherits the newest
//!   effective time at insertion, which keeps it at the tail.
//! - Every cached message was exchanged between the cache's two users.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use courtside_proto::{ConversationId, Message, MessageId, UserId};

/// The two participants of a direct conversation, seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationPair {
    /// Signed-in user.
    pub local: UserId,
    /// The other participant.
    pub counterpart: UserId,
}

impl ConversationPair {
    /// Pair of `local` and `counterpart`.
    pub fn new(local: UserId, counterpart: UserId) -> Self {
        Self { local, counterpart }
    }

    /// True if `message` was exchanged between the two participants.
    pub fn contains(&self, message: &Message) -> bool {
        message.is_between(self.local, self.counterpart)
    }

    /// Broadcast channel of this conversation.
    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::between(self.local, self.counterpart)
    }
}

/// Result of offering a message to a cache or reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New message, now cached.
    Inserted,
    /// Id already cached.
    Duplicate,
    /// Message belongs to another conversation.
    ForeignPair,
    /// Broadcast authored by the local user; the durable write covers it.
    OwnEcho,
    /// No conversation is open.
    Inactive,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    effective_at: Option<DateTime<Utc>>,
}

/// Ordered, duplicate-free messages of one conversation.
#[derive(Debug, Clone)]
pub struct ConversationCache {
    pair: ConversationPair,
    entries: Vec<Entry>,
    ids: HashSet<MessageId>,
}

impl ConversationCache {
    /// Empty cache for `pair`.
    pub fn new(pair: ConversationPair) -> Self {
        Self { pair, entries: Vec::new(), ids: HashSet::new() }
    }

    /// Participants of this conversation.
    pub fn pair(&self) -> ConversationPair {
        self.pair
    }

    /// Insert `message` at its ordered position.
    pub fn insert(&mut self, message: Message) -> MergeOutcome {
        if !self.pair.contains(&message) {
            return MergeOutcome::ForeignPair;
        }
        if self.ids.contains(&message.id) {
            return MergeOutcome::Duplicate;
        }

        let effective_at =
            message.sent_at().or_else(|| self.entries.last().and_then(|e| e.effective_at));
        // Equal timestamps keep arrival order.
        let position = self.entries.partition_point(|e| e.effective_at <= effective_at);

        self.ids.insert(message.id);
        self.entries.insert(position, Entry { message, effective_at });
        MergeOutcome::Inserted
    }

    /// True if a message with `id` is cached.
    pub fn contains(&self, id: MessageId) -> bool {
        self.ids.contains(&id)
    }

    /// Cached message with `id`.
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.entries.iter().find(|e| e.message.id == id).map(|e| &e.message)
    }

    /// Number of cached messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Messages in display order.
    pub fn messages(&self) -> impl DoubleEndedIterator<Item = &Message> + ExactSizeIterator {
        self.entries.iter().map(|e| &e.message)
    }

    /// Owned copy of the messages in display order.
    pub fn to_vec(&self) -> Vec<Message> {
        self.messages().cloned().collect()
    }

    /// Mark messages sent by `sender` as read. Returns how many changed.
    pub fn mark_read_from(&mut self, sender: UserId) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            if entry.message.sender_id == sender && !entry.message.read {
                entry.message.read = true;
                changed += 1;
            }
        }
        changed
    }

    fn absorb_read_flag(&mut self, incoming: &Message) {
        if !incoming.read {
            return;
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| e.message.id == incoming.id) {
            entry.message.read = true;
        }
    }
}

/// Union of `cache` with `fetched`.
///
/// Pure: returns a new cache and leaves the input untouched. Messages already
/// cached keep their position; a fetched copy can only set `read`, never
/// clear it. Fetched messages of other conversations are dropped.
pub fn merge_reload(
    cache: &ConversationCache,
    fetched: impl IntoIterator<Item = Message>,
) -> ConversationCache {
    let mut merged = cache.clone();

    for message in fetched {
        if merged.contains(message.id) {
            merged.absorb_read_flag(&message);
            continue;
        }
        if merged.insert(message) == MergeOutcome::ForeignPair {
            tracing::debug!(pair = ?merged.pair, "dropping reloaded message of another conversation");
        }
    }

    merged
}

/// Token tying a reload request to the conversation that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadTicket {
    generation: u64,
    pair: ConversationPair,
}

impl ReloadTicket {
    /// Counterpart whose messages should be fetched.
    pub fn counterpart(&self) -> UserId {
        self.pair.counterpart
    }

    /// Conversation the reload belongs to.
    pub fn pair(&self) -> ConversationPair {
        self.pair
    }
}

/// Result of applying a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Fetch merged into the open conversation.
    Merged {
        /// Messages that were not cached before.
        added: usize,
    },
    /// Conversation changed since the ticket was issued; fetch discarded.
    Stale,
}

/// Reconciles the open conversation of one signed-in user.
#[derive(Debug, Clone)]
pub struct Reconciler {
    local: UserId,
    generation: u64,
    cache: Option<ConversationCache>,
}

impl Reconciler {
    /// Reconciler for `local` with no open conversation.
    pub fn new(local: UserId) -> Self {
        Self { local, generation: 0, cache: None }
    }

    /// Signed-in user.
    pub fn local_user(&self) -> UserId {
        self.local
    }

    /// Open conversation, if any.
    pub fn pair(&self) -> Option<ConversationPair> {
        self.cache.as_ref().map(ConversationCache::pair)
    }

    /// Open a conversation with `counterpart`, replacing any open one.
    ///
    /// The cache starts empty. Returns the ticket for the initial load;
    /// tickets issued for earlier conversations become stale.
    pub fn open(&mut self, counterpart: UserId) -> ReloadTicket {
        let pair = ConversationPair::new(self.local, counterpart);
        self.generation += 1;
        self.cache = Some(ConversationCache::new(pair));
        tracing::debug!(%counterpart, generation = self.generation, "conversation opened");
        ReloadTicket { generation: self.generation, pair }
    }

    /// Ticket for refreshing the open conversation.
    pub fn reload_ticket(&self) -> Option<ReloadTicket> {
        self.pair().map(|pair| ReloadTicket { generation: self.generation, pair })
    }

    /// Close the open conversation. Outstanding tickets become stale.
    pub fn close(&mut self) {
        self.generation += 1;
        self.cache = None;
    }

    /// Merge the record returned by a successful durable write.
    pub fn apply_sent(&mut self, message: Message) -> MergeOutcome {
        match self.cache.as_mut() {
            Some(cache) => cache.insert(message),
            None => MergeOutcome::Inactive,
        }
    }

    /// Merge a broadcast received on `conversation_id`.
    ///
    /// Broadcasts authored by the local user are dropped; the durable write
    /// already delivered them, and duplicate ids are dropped either way.
    pub fn apply_broadcast(
        &mut self,
        conversation_id: &ConversationId,
        message: Message,
    ) -> MergeOutcome {
        let Some(cache) = self.cache.as_mut() else {
            return MergeOutcome::Inactive;
        };
        if *conversation_id != cache.pair().conversation_id() || !cache.pair().contains(&message) {
            return MergeOutcome::ForeignPair;
        }
        if message.sender_id == self.local {
            return MergeOutcome::OwnEcho;
        }
        cache.insert(message)
    }

    /// Merge a store fetch issued with `ticket`.
    pub fn apply_reload(
        &mut self,
        ticket: ReloadTicket,
        fetched: impl IntoIterator<Item = Message>,
    ) -> ReloadOutcome {
        match self.cache.as_mut() {
            Some(cache) if ticket.generation == self.generation && ticket.pair == cache.pair() => {
                let before = cache.len();
                *cache = merge_reload(cache, fetched);
                ReloadOutcome::Merged { added: cache.len() - before }
            },
            _ => {
                tracing::debug!(counterpart = %ticket.counterpart(), "discarding stale reload");
                ReloadOutcome::Stale
            },
        }
    }

    /// Mark the counterpart's messages read in the open conversation.
    pub fn mark_counterpart_read(&mut self) -> usize {
        match self.cache.as_mut() {
            Some(cache) => {
                let counterpart = cache.pair().counterpart;
                cache.mark_read_from(counterpart)
            },
            None => 0,
        }
    }

    /// Cache of the open conversation.
    pub fn cache(&self) -> Option<&ConversationCache> {
        self.cache.as_ref()
    }

    /// Messages of the open conversation in display order. Empty if none.
    pub fn messages(&self) -> Vec<Message> {
        self.cache.as_ref().map(ConversationCache::to_vec).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: UserId = UserId(1);
    const THEM: UserId = UserId(2);
    const OTHER: UserId = UserId(3);

    fn at(minute: i64) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(1_700_000_000 + minute * 60, 0)
    }

    fn msg(id: u64, from: UserId, to: UserId, minute: Option<i64>) -> Message {
        Message {
            id: MessageId(id),
            sender_id: from,
            receiver_id: to,
            content: format!("m{id}"),
            created_at: minute.and_then(at),
            timestamp: None,
            read: false,
        }
    }

    fn ids(cache: &ConversationCache) -> Vec<u64> {
        cache.messages().map(|m| m.id.0).collect()
    }

    #[test]
    fn insert_orders_by_creation_time() {
        let mut cache = ConversationCache::new(ConversationPair::new(ME, THEM));
        cache.insert(msg(3, ME, THEM, Some(3)));
        cache.insert(msg(1, THEM, ME, Some(1)));
        cache.insert(msg(2, ME, THEM, Some(2)));

        assert_eq!(ids(&cache), [1, 2, 3]);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut cache = ConversationCache::new(ConversationPair::new(ME, THEM));
        cache.insert(msg(9, ME, THEM, Some(1)));
        cache.insert(msg(4, THEM, ME, Some(1)));

        assert_eq!(ids(&cache), [9, 4]);
    }

    #[test]
    fn untimed_message_goes_to_tail() {
        let mut cache = ConversationCache::new(ConversationPair::new(ME, THEM));
        cache.insert(msg(1, ME, THEM, Some(5)));
        cache.insert(msg(2, THEM, ME, None));
        cache.insert(msg(3, ME, THEM, Some(5)));

        assert_eq!(ids(&cache), [1, 2, 3]);
    }

    #[test]
    fn legacy_timestamp_orders_too() {
        let mut cache = ConversationCache::new(ConversationPair::new(ME, THEM));
        let mut legacy = msg(1, ME, THEM, None);
        legacy.timestamp = at(10);
        cache.insert(legacy);
        cache.insert(msg(2, ME, THEM, Some(1)));

        assert_eq!(ids(&cache), [2, 1]);
    }

    #[test]
    fn duplicates_and_foreign_messages_are_rejected() {
        let mut cache = ConversationCache::new(ConversationPair::new(ME, THEM));

        assert_eq!(cache.insert(msg(1, ME, THEM, Some(1))), MergeOutcome::Inserted);
        assert_eq!(cache.insert(msg(1, ME, THEM, Some(1))), MergeOutcome::Duplicate);
        assert_eq!(cache.insert(msg(2, ME, OTHER, Some(2))), MergeOutcome::ForeignPair);
        assert_eq!(cache.insert(msg(3, THEM, OTHER, Some(2))), MergeOutcome::ForeignPair);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn merge_reload_is_pure_union() {
        let mut cache = ConversationCache::new(ConversationPair::new(ME, THEM));
        cache.insert(msg(2, ME, THEM, Some(2)));

        let merged = merge_reload(&cache, vec![
            msg(1, THEM, ME, Some(1)),
            msg(2, ME, THEM, Some(2)),
            msg(7, OTHER, ME, Some(3)),
        ]);

        assert_eq!(ids(&cache), [2]);
        assert_eq!(ids(&merged), [1, 2]);
    }

    #[test]
    fn merge_reload_only_sets_read() {
        let mut cache = ConversationCache::new(ConversationPair::new(ME, THEM));
        let mut read = msg(1, THEM, ME, Some(1));
        read.read = true;
        cache.insert(read);
        cache.insert(msg(2, THEM, ME, Some(2)));

        let mut fetched_two = msg(2, THEM, ME, Some(2));
        fetched_two.read = true;
        let merged = merge_reload(&cache, vec![msg(1, THEM, ME, Some(1)), fetched_two]);

        assert!(merged.messages().all(|m| m.read));
    }

    #[test]
    fn own_broadcast_is_an_echo() {
        let mut reconciler = Reconciler::new(ME);
        reconciler.open(THEM);
        let channel = ConversationId::between(ME, THEM);

        assert_eq!(reconciler.apply_broadcast(&channel, msg(1, ME, THEM, Some(1))), MergeOutcome::OwnEcho);
        assert_eq!(reconciler.apply_broadcast(&channel, msg(2, THEM, ME, Some(2))), MergeOutcome::Inserted);
        assert_eq!(reconciler.apply_broadcast(&channel, msg(2, THEM, ME, Some(2))), MergeOutcome::Duplicate);
    }

    #[test]
    fn broadcast_for_other_conversation_is_dropped() {
        let mut reconciler = Reconciler::new(ME);
        reconciler.open(THEM);

        let other_channel = ConversationId::between(ME, OTHER);
        assert_eq!(
            reconciler.apply_broadcast(&other_channel, msg(1, OTHER, ME, Some(1))),
            MergeOutcome::ForeignPair
        );
        // Right channel, wrong participants.
        let channel = ConversationId::between(ME, THEM);
        assert_eq!(
            reconciler.apply_broadcast(&channel, msg(2, OTHER, ME, Some(1))),
            MergeOutcome::ForeignPair
        );
        assert!(reconciler.messages().is_empty());
    }

    #[test]
    fn sent_then_echo_then_reload_yields_one_copy() {
        let mut reconciler = Reconciler::new(ME);
        let ticket = reconciler.open(THEM);
        let sent = msg(5, ME, THEM, Some(1));

        assert_eq!(reconciler.apply_sent(sent.clone()), MergeOutcome::Inserted);
        reconciler.apply_broadcast(&ConversationId::between(ME, THEM), sent.clone());
        reconciler.apply_reload(ticket, vec![sent]);

        assert_eq!(reconciler.messages().len(), 1);
    }

    #[test]
    fn reload_after_switch_is_stale() {
        let mut reconciler = Reconciler::new(ME);
        let first = reconciler.open(THEM);
        reconciler.open(OTHER);

        assert_eq!(reconciler.apply_reload(first, vec![msg(1, THEM, ME, Some(1))]), ReloadOutcome::Stale);
        assert!(reconciler.messages().is_empty());

        reconciler.close();
        assert_eq!(reconciler.apply_sent(msg(2, ME, OTHER, Some(1))), MergeOutcome::Inactive);
    }

    #[test]
    fn reload_ticket_tracks_open_conversation() {
        let mut reconciler = Reconciler::new(ME);
        assert!(reconciler.reload_ticket().is_none());

        reconciler.open(THEM);
        let ticket = reconciler.reload_ticket().unwrap();
        assert_eq!(ticket.counterpart(), THEM);
        assert_eq!(
            reconciler.apply_reload(ticket, vec![msg(1, THEM, ME, Some(1)), msg(2, ME, THEM, Some(2))]),
            ReloadOutcome::Merged { added: 2 }
        );
    }

    #[test]
    fn mark_counterpart_read_touches_only_incoming() {
        let mut reconciler = Reconciler::new(ME);
        reconciler.open(THEM);
        reconciler.apply_sent(msg(1, ME, THEM, Some(1)));
        reconciler.apply_broadcast(&ConversationId::between(ME, THEM), msg(2, THEM, ME, Some(2)));

        assert_eq!(reconciler.mark_counterpart_read(), 1);
        let messages = reconciler.messages();
        assert!(!messages[0].read);
        assert!(messages[1].read);
    }
}
