//! Property-based tests for conversation cache merging.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use courtside_core::{ConversationCache, ConversationPair, MergeOutcome, merge_reload};
use courtside_proto::{Message, MessageId, UserId};
use proptest::prelude::*;

const LOCAL: UserId = UserId(1);
const COUNTERPART: UserId = UserId(2);

fn at(second: u8) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(i64::from(second))
}

/// Messages of the pair with small id and timestamp ranges so collisions
/// and ties are common. A few carry no timestamp.
fn message_strategy() -> impl Strategy<Value = Message> {
    (1u64..24, any::<bool>(), prop::option::weighted(0.9, 0u8..12), any::<bool>()).prop_map(
        |(id, outgoing, second, read)| {
            let (sender_id, receiver_id) =
                if outgoing { (LOCAL, COUNTERPART) } else { (COUNTERPART, LOCAL) };
            Message {
                id: MessageId(id),
                sender_id,
                receiver_id,
                content: format!("m{id}"),
                created_at: second.map(at),
                timestamp: None,
                read,
            }
        },
    )
}

fn batch() -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(message_strategy(), 0..20)
}

fn empty_cache() -> ConversationCache {
    ConversationCache::new(ConversationPair::new(LOCAL, COUNTERPART))
}

fn ids(cache: &ConversationCache) -> Vec<MessageId> {
    cache.messages().map(|m| m.id).collect()
}

proptest! {
    /// Every id appears once, whatever mix of inserts and merges fed it.
    #[test]
    fn prop_one_entry_per_id(pushes in batch(), reloads in prop::collection::vec(batch(), 0..4)) {
        let mut cache = empty_cache();
        let mut expected = BTreeSet::new();

        for message in pushes {
            expected.insert(message.id);
            cache.insert(message);
        }
        for fetched in reloads {
            expected.extend(fetched.iter().map(|m| m.id));
            cache = merge_reload(&cache, fetched);
        }

        let cached = ids(&cache);
        let unique: BTreeSet<_> = cached.iter().copied().collect();
        prop_assert_eq!(cached.len(), unique.len());
        prop_assert_eq!(unique, expected);
    }

    /// Timestamped entries are never out of order, and ties keep arrival
    /// order.
    #[test]
    fn prop_order_is_stable(messages in batch()) {
        let mut cache = empty_cache();
        let mut arrival = Vec::new();
        for message in messages {
            let id = message.id;
            if cache.insert(message) == MergeOutcome::Inserted {
                arrival.push(id);
            }
        }

        let timed: Vec<_> = cache.messages().filter_map(|m| m.created_at.map(|t| (t, m.id))).collect();
        for pair in timed.windows(2) {
            prop_assert!(pair[0].0 <= pair[1].0);
            if pair[0].0 == pair[1].0 {
                let first = arrival.iter().position(|id| *id == pair[0].1);
                let second = arrival.iter().position(|id| *id == pair[1].1);
                prop_assert!(first < second, "tie broken against arrival order");
            }
        }
    }

    /// Merging the same fetch twice changes nothing the second time.
    #[test]
    fn prop_merge_is_idempotent(existing in batch(), fetched in batch()) {
        let mut cache = empty_cache();
        for message in existing {
            cache.insert(message);
        }

        let once = merge_reload(&cache, fetched.clone());
        let twice = merge_reload(&once, fetched);
        prop_assert_eq!(once.to_vec(), twice.to_vec());
    }

    /// A merge never moves or drops a cached message and never clears
    /// `read`.
    #[test]
    fn prop_merge_preserves_cached_entries(existing in batch(), fetched in batch()) {
        let mut cache = empty_cache();
        for message in existing {
            cache.insert(message);
        }

        let merged = merge_reload(&cache, fetched);

        let before = ids(&cache);
        let kept: Vec<_> = ids(&merged).into_iter().filter(|id| before.contains(id)).collect();
        prop_assert_eq!(kept, before);
        for message in cache.messages() {
            let after = merged.get(message.id).unwrap();
            prop_assert!(after.read || !message.read);
        }
    }

    /// Messages of other conversations never enter the cache.
    #[test]
    fn prop_foreign_messages_rejected(fetched in batch(), stranger in 3u64..100) {
        let foreign: Vec<_> = fetched
            .into_iter()
            .map(|mut m| {
                m.receiver_id = UserId(stranger);
                m.sender_id = LOCAL;
                m
            })
            .collect();

        let merged = merge_reload(&empty_cache(), foreign);
        prop_assert!(merged.is_empty());
    }
}
