//! WebSocket transport.
//!
//! Thin socket slot over tokio-tungstenite. Frames are plain JSON text;
//! protocol logic stays in the Sans-IO connection manager.

use courtside_app::{Transport, TransportEvent};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// No socket is open.
    #[error("socket is not open")]
    NotOpen,

    /// Read or write on an open socket failed.
    #[error("stream error: {0}")]
    Stream(String),
}

/// WebSocket connection to the conversation server.
pub struct WsTransport {
    url: String,
    socket: Option<Socket>,
}

impl WsTransport {
    /// Transport for `url` (`ws://` or `wss://`). Nothing connects until
    /// [`Transport::open`].
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), socket: None }
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// True while a socket is held.
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }
}

impl Transport for WsTransport {
    type Error = TransportError;

    async fn open(&mut self) -> Result<(), TransportError> {
        if let Some(mut stale) = self.socket.take()
            && let Err(err) = stale.close(None).await
        {
            tracing::debug!(error = %err, "stale socket did not close cleanly");
        }

        let (socket, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        tracing::debug!(url = %self.url, status = %response.status(), "socket open");

        self.socket = Some(socket);
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::NotOpen)?;
        socket.send(Message::Text(text.into())).await.map_err(|e| TransportError::Stream(e.to_string()))
    }

    async fn recv(&mut self) -> TransportEvent {
        let Some(socket) = self.socket.as_mut() else {
            return std::future::pending().await;
        };

        let event = loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => break TransportEvent::Text(text.as_str().to_owned()),
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    break TransportEvent::Closed { code, was_clean: true };
                },
                // Pings are answered by tungstenite on the next read.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {},
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "socket read failed");
                    break TransportEvent::Closed { code: None, was_clean: false };
                },
                None => break TransportEvent::Closed { code: None, was_clean: false },
            }
        };

        if let TransportEvent::Closed { was_clean, .. } = &event {
            let socket = self.socket.take();
            if let Some(mut socket) = socket.filter(|_| *was_clean) {
                // Flush the queued close reply off the read path so `recv` stays cancel-safe.
                tokio::spawn(async move {
                    if let Err(err) = socket.close(None).await {
                        tracing::debug!(error = %err, "close reply not delivered");
                    }
                });
            }
        }
        event
    }

    async fn close(&mut self, code: u16, reason: String) -> Result<(), TransportError> {
        let Some(mut socket) = self.socket.take() else {
            return Ok(());
        };

        let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
        socket.close(Some(frame)).await.map_err(|e| TransportError::Stream(e.to_string()))
    }
}

