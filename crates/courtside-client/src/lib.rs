//! Production I/O for the Courtside conversation layer.
//!
//! # Components
//!
//! - [`WsTransport`]: WebSocket socket slot built on tokio-tungstenite
//! - [`HttpStore`]: durable message API over HTTP with bearer auth
//! - [`SystemEnv`]: real clock and tokio timers

#![forbid(unsafe_code)]

mod store;
mod system_env;
mod transport;

pub use store::{DEFAULT_REQUEST_TIMEOUT, HttpStore};
pub use system_env::SystemEnv;
pub use transport::{TransportError, WsTransport};
