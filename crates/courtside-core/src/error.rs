//! Error types for the connection layer.
//!
//! Transport and authentication failures are surfaced as state changes and
//! [`crate::ConnectionEvent::Error`] events rather than returned from a single
//! call, since consumers react to them continuously (disable the send button,
//! show the disconnected indicator). Only synchronous preconditions, such as
//! sending while unauthenticated, come back as `Err`.

use thiserror::Error;

use crate::connection::ConnectionState;

/// Errors that can occur in the connection state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// No credential could be resolved when a connection attempt started.
    #[error("not authenticated: no credential available")]
    NotAuthenticated,

    /// Server rejected the credential or the handshake timed out.
    #[error("authentication failed: {reason}")]
    AuthenticationFailed {
        /// Server message or timeout description.
        reason: String,
    },

    /// Operation requires an authenticated connection.
    #[error("not connected: connection is {state:?}")]
    NotConnected {
        /// State at the time of the attempt.
        state: ConnectionState,
    },

    /// Reconnect attempts exhausted without a successful authentication.
    #[error("connection failed permanently after {attempts} attempts")]
    ConnectionFailedPermanently {
        /// Consecutive failed attempts.
        attempts: u32,
    },

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when error occurred.
        state: ConnectionState,
        /// Operation that was attempted.
        operation: String,
    },

    /// Socket-level failure. Recovered by the reconnect policy.
    #[error("transport error: {0}")]
    Transport(String),

    /// Error frame received on an authenticated connection.
    #[error("server error: {0}")]
    Server(String),

    /// Frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConnectionError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Transport failures heal through the reconnect policy and joins queue
    /// while not connected. Authentication failures and exhausted retries need
    /// user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotConnected { .. })
    }
}

impl From<courtside_proto::ProtocolError> for ConnectionError {
    fn from(err: courtside_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        assert!(ConnectionError::Transport("reset".into()).is_transient());
        assert!(
            ConnectionError::NotConnected { state: ConnectionState::Connecting }.is_transient()
        );
    }

    #[test]
    fn auth_and_exhaustion_are_fatal() {
        assert!(!ConnectionError::NotAuthenticated.is_transient());
        assert!(
            !ConnectionError::AuthenticationFailed { reason: "bad token".into() }.is_transient()
        );
        assert!(!ConnectionError::ConnectionFailedPermanently { attempts: 5 }.is_transient());
        assert!(!ConnectionError::Protocol("bad json".into()).is_transient());
    }
}
