//! Errors surfaced to conversation callers.

use courtside_core::ConnectionError;
use thiserror::Error;

use crate::{StoreError, ViewId};

/// Failures of a send from a conversation view.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// Content was empty or whitespace only.
    #[error("message content is empty")]
    EmptyContent,

    /// The view has no counterpart to send to.
    #[error("no counterpart selected")]
    NoCounterpart,

    /// The durable write failed; nothing was broadcast.
    ///
    /// The content is handed back so the caller can offer a retry.
    #[error("message could not be saved: {source}")]
    DurableWriteFailed {
        /// Content of the failed send.
        content: String,
        /// Store failure.
        source: StoreError,
    },

    /// The view was closed before the send completed.
    #[error("conversation {0} is closed")]
    ViewClosed(ViewId),

    /// The runtime is no longer running.
    #[error("conversation runtime stopped")]
    Stopped,
}

impl ChatError {
    /// Content to restore in the input field after a failed send.
    pub fn retry_content(&self) -> Option<&str> {
        match self {
            Self::DurableWriteFailed { content, .. } => Some(content),
            _ => None,
        }
    }
}

/// Failures of runtime handle operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// No open view with this id.
    #[error("unknown conversation view {0}")]
    UnknownView(ViewId),

    /// The runtime is no longer running.
    #[error("conversation runtime stopped")]
    Stopped,

    /// Connection failure that prevented the operation.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
