//! Socket slot onto a [`SimServer`].
//!
//! Implements [`Transport`] so the production [`courtside_app::Runtime`]
//! runs unchanged against the simulated server.

use courtside_app::{Transport, TransportEvent};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::SimServer;

/// Simulated transport failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SimTransportError {
    /// Server refused the socket.
    #[error("server unreachable")]
    Unreachable,

    /// No socket is open.
    #[error("socket is not open")]
    NotOpen,

    /// Server already dropped the socket.
    #[error("socket closed by server")]
    Closed,
}

/// One client's simulated socket.
pub struct SimTransport {
    server: SimServer,
    socket: Option<(u64, mpsc::UnboundedReceiver<TransportEvent>)>,
}

impl SimTransport {
    /// Transport connecting to `server`.
    pub fn new(server: SimServer) -> Self {
        Self { server, socket: None }
    }

    /// Server-side id of the open socket.
    pub fn socket_id(&self) -> Option<u64> {
        self.socket.as_ref().map(|(id, _)| *id)
    }
}

impl Transport for SimTransport {
    type Error = SimTransportError;

    async fn open(&mut self) -> Result<(), SimTransportError> {
        if let Some((stale, _)) = self.socket.take() {
            self.server.disconnect(stale);
        }
        let socket = self.server.accept().ok_or(SimTransportError::Unreachable)?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), SimTransportError> {
        let (id, _) = self.socket.as_ref().ok_or(SimTransportError::NotOpen)?;
        if self.server.receive(*id, &text) { Ok(()) } else { Err(SimTransportError::Closed) }
    }

    async fn recv(&mut self) -> TransportEvent {
        let Some((_, inbox)) = self.socket.as_mut() else {
            return std::future::pending().await;
        };

        let event =
            inbox.recv().await.unwrap_or(TransportEvent::Closed { code: None, was_clean: false });
        if matches!(event, TransportEvent::Closed { .. }) {
            self.socket = None;
        }
        event
    }

    async fn close(&mut self, _code: u16, _reason: String) -> Result<(), SimTransportError> {
        if let Some((id, _)) = self.socket.take() {
            self.server.disconnect(id);
        }
        Ok(())
    }
}
