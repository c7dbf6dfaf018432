//! Core state machines for the Courtside conversation layer.
//!
//! Everything in this crate is Sans-IO: methods take the current time as input
//! and return actions for a driver to execute. No socket, timer, or task lives
//! here, which keeps every transition reproducible under simulated time.
//!
//! # Components
//!
//! - [`ConnectionManager`]: socket lifecycle, auth handshake, heartbeat, and
//!   reconnect backoff
//! - [`SubscriptionTracker`]: declarative channel membership, replayed after
//!   every re-authentication
//! - [`Reconciler`]: merges durable-write results, socket broadcasts, and
//!   reloads into one ordered, duplicate-free list per conversation
//! - [`Environment`]: time source abstraction (real or virtual)

#![forbid(unsafe_code)]

pub mod connection;
pub mod credential;
pub mod env;
pub mod error;
pub mod reconcile;
pub mod subscription;

pub use connection::{
    ConnectionAction, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState,
};
pub use credential::{CredentialProvider, SharedCredential, StaticCredential};
pub use env::{Environment, MonotonicInstant};
pub use error::ConnectionError;
pub use reconcile::{
    ConversationCache, ConversationPair, MergeOutcome, Reconciler, ReloadOutcome, ReloadTicket,
    merge_reload,
};
pub use subscription::SubscriptionTracker;
