//! Durable message records.
//!
//! The message store owns these records. The conversation layer only caches
//! copies, keyed by [`MessageId`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConversationId, MessageId, UserId};

/// A direct message between two users, as returned by the message store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned id. Unique across the store.
    pub id: MessageId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Recipient of the message.
    pub receiver_id: UserId,
    /// Message body.
    pub content: String,
    /// Creation time. Some records only carry `timestamp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Legacy creation time field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Whether the recipient has read the message.
    #[serde(default)]
    pub read: bool,
}

impl Message {
    /// Creation time, preferring `createdAt` over `timestamp`.
    ///
    /// `None` when the record carries neither.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.created_at.or(self.timestamp)
    }

    /// Conversation channel this message is broadcast on.
    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::between(self.sender_id, self.receiver_id)
    }

    /// True if the message was exchanged between exactly `a` and `b`, in
    /// either direction.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

/// Request body for creating a message in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    /// Recipient of the message.
    pub receiver_id: UserId,
    /// Message body, already validated as non-empty.
    pub content: String,
}
