//! JSON text frames.
//!
//! Every frame is a JSON object with a `type` discriminator. Client and server
//! frames are separate enums so a decoder can only ever produce frames that
//! are legal in its direction.
//!
//! # Forward compatibility
//!
//! Server frames with an unrecognized `type` decode to
//! [`ServerFrame::Unknown`] instead of failing. Callers log and ignore them.

use serde::{Deserialize, Serialize};

use crate::{
    ChannelId, ConversationId, FacilityId, Message,
    errors::{ProtocolError, Result},
};

/// WebSocket close codes with protocol meaning.
pub mod close_code {
    /// Clean shutdown requested by either side.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away (page unload, server restart).
    pub const GOING_AWAY: u16 = 1001;
    /// Transport dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Client gave up waiting for `auth_success`.
    pub const AUTH_TIMEOUT: u16 = 4001;
    /// Server rejected the credential.
    pub const AUTH_REJECTED: u16 = 4003;

    /// Codes after which the client must not schedule an automatic retry.
    pub const NO_RETRY: [u16; 4] = [NORMAL, GOING_AWAY, AUTH_TIMEOUT, AUTH_REJECTED];

    /// True if a close with this code must not be retried automatically.
    pub fn is_terminal(code: u16) -> bool {
        NO_RETRY.contains(&code)
    }
}

/// Frames sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Authenticate the connection with a bearer credential.
    Auth {
        /// Opaque bearer token.
        token: String,
    },

    /// Start receiving broadcasts for a conversation.
    #[serde(rename_all = "camelCase")]
    JoinConversation {
        /// Conversation channel to join.
        conversation_id: ConversationId,
    },

    /// Stop receiving broadcasts for a conversation.
    #[serde(rename_all = "camelCase")]
    LeaveConversation {
        /// Conversation channel to leave.
        conversation_id: ConversationId,
    },

    /// Start receiving broadcasts for a facility.
    #[serde(rename_all = "camelCase")]
    SubscribeFacility {
        /// Facility channel to join.
        facility_id: FacilityId,
    },

    /// Stop receiving broadcasts for a facility.
    #[serde(rename_all = "camelCase")]
    UnsubscribeFacility {
        /// Facility channel to leave.
        facility_id: FacilityId,
    },

    /// Broadcast an already persisted message to the conversation channel.
    #[serde(rename_all = "camelCase")]
    Message {
        /// Channel the message is broadcast on.
        conversation_id: ConversationId,
        /// Full record as returned by the message store.
        message: Message,
    },

    /// Heartbeat.
    Ping {
        /// Sender wall clock, milliseconds since the Unix epoch.
        timestamp: u64,
    },
}

impl ClientFrame {
    /// Join frame for a channel.
    pub fn join(channel: &ChannelId) -> Self {
        match channel {
            ChannelId::Conversation(id) => Self::JoinConversation { conversation_id: id.clone() },
            ChannelId::Facility(id) => Self::SubscribeFacility { facility_id: *id },
        }
    }

    /// Leave frame for a channel.
    pub fn leave(channel: &ChannelId) -> Self {
        match channel {
            ChannelId::Conversation(id) => Self::LeaveConversation { conversation_id: id.clone() },
            ChannelId::Facility(id) => Self::UnsubscribeFacility { facility_id: *id },
        }
    }

    /// Wire `type` of this frame. Safe to log, unlike the frame itself.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::JoinConversation { .. } => "join_conversation",
            Self::LeaveConversation { .. } => "leave_conversation",
            Self::SubscribeFacility { .. } => "subscribe_facility",
            Self::UnsubscribeFacility { .. } => "unsubscribe_facility",
            Self::Message { .. } => "message",
            Self::Ping { .. } => "ping",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::encode(&e))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::decode(&e))
    }
}

/// Frames pushed from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Authentication handshake completed.
    AuthSuccess,

    /// Informational greeting sent when the socket opens.
    #[serde(rename_all = "camelCase")]
    Connected {
        /// Server-side identifier of this socket.
        client_id: String,
    },

    /// Authentication or protocol failure.
    Error {
        /// Human readable reason.
        #[serde(default)]
        message: String,
    },

    /// Real-time delivery of a message on a joined channel.
    #[serde(rename_all = "camelCase")]
    Message {
        /// Channel the message was broadcast on.
        conversation_id: ConversationId,
        /// Full message record.
        message: Message,
    },

    /// Heartbeat acknowledgement.
    Pong,

    /// Any frame type this client does not understand.
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    /// Wire `type` of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthSuccess => "auth_success",
            Self::Connected { .. } => "connected",
            Self::Error { .. } => "error",
            Self::Message { .. } => "message",
            Self::Pong => "pong",
            Self::Unknown => "unknown",
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// [`ServerFrame::Unknown`] has no wire form and encodes as
    /// `{"type":"unknown"}`.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::encode(&e))
    }

    /// Parse a JSON text frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Decode` if the text is not a JSON object with a
    ///   string `type`, or a known type has malformed fields.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::decode(&e))
    }
}
