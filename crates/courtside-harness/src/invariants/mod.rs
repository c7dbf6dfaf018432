//! Invariants over simulated conversation clients.
//!
//! Every check looks at one client at a time: its reconciled conversation,
//! its local channel membership and, when the simulated server is in the
//! loop, what the server recorded for that user. A [`SystemSnapshot`] holds
//! one [`ClientSnapshot`] per simulated user and the registry runs every
//! check against every client, collecting all violations.
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! registry.assert_all(&SystemSnapshot::single(driver.snapshot(user)), "after outage");
//! ```

mod checks;
mod snapshot;

use std::fmt;

use courtside_proto::UserId;

pub use checks::{
    ChronologicalOrder, ConversationIsolation, MembershipConvergence, NoDuplicateMessages,
};
pub use snapshot::{ClientSnapshot, SystemSnapshot};

/// Result of checking one invariant against a whole snapshot.
pub type InvariantResult = Result<(), Vec<Violation>>;

/// A broken invariant, attributed to the client it was observed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Invariant name.
    pub invariant: &'static str,
    /// Client whose state broke it.
    pub user: UserId,
    /// What was observed.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] user {}: {}", self.invariant, self.user, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property of a single client's observable state.
pub trait Invariant: Send + Sync {
    /// Name used in violation reports.
    fn name(&self) -> &'static str;

    /// Check one client. `Err` describes the first problem found.
    fn check_client(&self, client: &ClientSnapshot) -> Result<(), String>;

    /// Check every client of the snapshot.
    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        let violations: Vec<_> = state
            .clients
            .iter()
            .filter_map(|client| {
                self.check_client(client).err().map(|message| Violation {
                    invariant: self.name(),
                    user: client.user,
                    message,
                })
            })
            .collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }
}

/// Set of invariants checked together after every simulated step.
#[derive(Default)]
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantRegistry {
    /// Registry with no checks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dedup, order, isolation and membership convergence.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(NoDuplicateMessages);
        registry.add(ChronologicalOrder);
        registry.add(ConversationIsolation);
        registry.add(MembershipConvergence);
        registry
    }

    /// Register another check.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Names of the registered checks, in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.invariants.iter().map(|inv| inv.name()).collect()
    }

    /// Run every check against every client.
    pub fn check_all(&self, state: &SystemSnapshot) -> InvariantResult {
        let violations: Vec<_> = self
            .invariants
            .iter()
            .filter_map(|inv| inv.check(state).err())
            .flatten()
            .collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Panic listing every violation, labelled with `context`.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &SystemSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let lines: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("{} violation(s) {context}:\n  {}", lines.len(), lines.join("\n  "));
        }
    }

    /// Number of registered checks.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverEmpty;

    impl Invariant for NeverEmpty {
        fn name(&self) -> &'static str {
            "never_empty"
        }

        fn check_client(&self, client: &ClientSnapshot) -> Result<(), String> {
            if client.messages.is_empty() { Err("no messages".into()) } else { Ok(()) }
        }
    }

    #[test]
    fn standard_registry_lists_conversation_checks() {
        let registry = InvariantRegistry::standard();
        assert_eq!(registry.names(), vec![
            "no_duplicate_messages",
            "chronological_order",
            "conversation_isolation",
            "membership_convergence",
        ]);
    }

    #[test]
    fn no_clients_means_no_violations() {
        assert!(InvariantRegistry::standard().check_all(&SystemSnapshot::empty()).is_ok());
    }

    #[test]
    fn violations_are_reported_per_client() {
        let mut registry = InvariantRegistry::new();
        registry.add(NeverEmpty);
        let state = SystemSnapshot::from_clients(vec![
            ClientSnapshot::new(UserId(1)),
            ClientSnapshot::new(UserId(2)),
        ]);

        let violations = registry.check_all(&state).unwrap_err();
        let users: Vec<_> = violations.iter().map(|v| v.user).collect();
        assert_eq!(users, vec![UserId(1), UserId(2)]);
        assert_eq!(violations[0].to_string(), "[never_empty] user 1: no messages");
    }

    #[test]
    #[should_panic(expected = "violation(s) after step 3")]
    fn assert_all_panics_with_context() {
        let mut registry = InvariantRegistry::new();
        registry.add(NeverEmpty);
        registry.assert_all(&SystemSnapshot::single(ClientSnapshot::new(UserId(5))), "after step 3");
    }
}
