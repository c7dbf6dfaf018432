//! Transport trait for abstracting socket I/O.
//!
//! The [`Transport`] trait decouples the [`crate::Runtime`] from a specific
//! socket implementation. Production uses a WebSocket; simulation uses an
//! in-memory server model with scripted failures.

use std::future::Future;

/// Inbound socket events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Text frame received.
    Text(String),

    /// Socket closed by the peer or the network.
    Closed {
        /// Close code, if a close frame arrived.
        code: Option<u16>,
        /// Whether the close handshake completed.
        was_clean: bool,
    },
}

/// One reusable socket slot.
///
/// At most one socket is open at a time. `open` after a close replaces it.
pub trait Transport: Send + 'static {
    /// Transport-specific error type.
    type Error: std::error::Error + Send + 'static;

    /// Open a new socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be established.
    fn open(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Write one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is not open or the write fails.
    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Next inbound event.
    ///
    /// Must be cancel-safe. Only polled while the socket is open.
    fn recv(&mut self) -> impl Future<Output = TransportEvent> + Send;

    /// Close the socket with `code`. Closing a closed socket is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the close frame cannot be written; the socket is
    /// dropped regardless.
    fn close(
        &mut self,
        code: u16,
        reason: String,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
