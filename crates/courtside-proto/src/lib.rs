//! Courtside wire protocol
//!
//! JSON text frames exchanged over the conversation socket, plus the domain
//! records those frames carry.
//!
//! # Components
//!
//! - [`ClientFrame`]: frames the client sends (auth, join/leave, message, ping)
//! - [`ServerFrame`]: frames the server pushes, decoded through one tagged enum
//! - [`Message`]: the durable message record, owned by the message store
//! - [`ChannelId`]: logical broadcast channel (conversation or facility)

#![forbid(unsafe_code)]

pub mod errors;
mod frame;
mod ids;
mod message;

pub use errors::{ProtocolError, Result};
pub use frame::{ClientFrame, ServerFrame, close_code};
pub use ids::{ChannelId, ConversationId, FacilityId, MessageId, UserId};
pub use message::{Message, NewMessage};
