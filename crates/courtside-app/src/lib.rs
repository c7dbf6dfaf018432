//! Application layer for Courtside conversations
//!
//! Pure view and session state machines plus a generic async runtime, so the
//! same orchestration runs in production and under simulated transports.
//!
//! # Components
//!
//! - [`ConversationView`]: per-conversation view model (lifecycle, send, poll)
//! - [`Session`]: bridge between the connection manager, channel membership,
//!   and transport commands; one per signed-in session
//! - [`MessageStore`]: durable message API seam
//! - [`Transport`]: socket I/O seam
//! - [`Runtime`] / [`RuntimeHandle`]: the event loop and its cloneable handle

#![forbid(unsafe_code)]

mod error;
mod runtime;
mod session;
mod store;
mod transport;
mod view;

pub use error::{ChatError, RuntimeError};
pub use runtime::{Runtime, RuntimeConfig, RuntimeHandle};
pub use session::{ConnectionStatus, Session, SessionEvent, TransportCommand};
pub use store::{MessageStore, StoreError};
pub use transport::{Transport, TransportEvent};
pub use view::{ConversationView, ViewAction, ViewConfig, ViewEvent, ViewId, ViewSnapshot};
