//! Durable message store seam.
//!
//! The store is the system of record. The socket only shortens the time until
//! a counterpart sees a message, so every send goes through
//! [`MessageStore::create_message`] whatever the socket state.

use async_trait::async_trait;
use courtside_proto::{Message, NewMessage, UserId};
use thiserror::Error;

/// Failures of the durable message API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No credential available for the request.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Request never produced a response.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Store answered with a failure status.
    #[error("store rejected request with status {status}: {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Response body was not the expected shape.
    #[error("malformed store response: {0}")]
    Decode(String),
}

impl StoreError {
    /// True if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::NotAuthenticated | Self::Decode(_) => false,
        }
    }
}

/// Durable message API consumed by the conversation layer.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Persist a message. Returns the record with its assigned id.
    async fn create_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// All messages between the signed-in user and `counterpart`, oldest
    /// first.
    async fn list_messages(&self, counterpart: UserId) -> Result<Vec<Message>, StoreError>;

    /// Mark messages from `counterpart` as read.
    async fn mark_read(&self, counterpart: UserId) -> Result<(), StoreError>;
}
