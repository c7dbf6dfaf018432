//! Deterministic simulation harness for the Courtside conversation layer.
//!
//! In-memory implementations of the Environment, Transport and MessageStore
//! seams for reproducible testing of reconnects, outages and racing
//! deliveries.
//!
//! # Components
//!
//! - [`SimEnv`]: tokio's clock, which tests pause and advance explicitly
//! - [`SimServer`]: model of the conversation socket server that records the
//!   channels each socket joined and rebroadcasts messages
//! - [`SimTransport`]: one client's socket slot onto a [`SimServer`]
//! - [`MessageLog`] / [`MemoryStore`]: the durable message store with fault
//!   injection
//! - [`SimDriver`]: drives a [`courtside_app::Session`] against a
//!   [`SimServer`] synchronously, for property tests
//!
//! # Invariant Testing
//!
//! The `invariants` module checks what must hold on every execution path:
//! no duplicate ids, chronological order, conversation isolation and
//! membership convergence. Use [`InvariantRegistry::standard()`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod memory_store;
pub mod sim_driver;
pub mod sim_env;
pub mod sim_server;
pub mod sim_transport;

pub use invariants::{
    ChronologicalOrder, ClientSnapshot, ConversationIsolation, Invariant, InvariantRegistry,
    InvariantResult, MembershipConvergence, NoDuplicateMessages, SystemSnapshot, Violation,
};
pub use memory_store::{MemoryStore, MessageLog};
pub use sim_driver::SimDriver;
pub use sim_env::SimEnv;
pub use sim_server::{AuthMode, SimServer};
pub use sim_transport::{SimTransport, SimTransportError};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock shared simulation state. A panicked test thread leaves the data
/// usable for the remaining assertions.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
