//! Bearer credential lookup.
//!
//! The session system owns the credential; this layer only reads it. The
//! lookup runs at every connection attempt because the token may have rotated
//! since the previous one.

use std::{
    fmt,
    sync::{Arc, RwLock},
};

/// Synchronous source of the current bearer token.
pub trait CredentialProvider: Send + Sync {
    /// Current token, or `None` if the user is signed out.
    fn token(&self) -> Option<String>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// Fixed credential, mostly for tools and tests.
#[derive(Clone, Default)]
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    /// Credential that always resolves to `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// Credential that never resolves.
    pub fn none() -> Self {
        Self(None)
    }
}

impl CredentialProvider for StaticCredential {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

impl fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = if self.0.is_some() { "<redacted>" } else { "<none>" };
        f.debug_tuple("StaticCredential").field(&shown).finish()
    }
}

/// Credential cell shared between the socket and the HTTP store.
///
/// Cloning shares the cell, so a rotation through [`SharedCredential::set`]
/// is seen by the next connection attempt and the next request.
#[derive(Clone, Default)]
pub struct SharedCredential(Arc<RwLock<Option<String>>>);

impl SharedCredential {
    /// Cell holding `token`.
    pub fn new(token: Option<String>) -> Self {
        Self(Arc::new(RwLock::new(token)))
    }

    /// Replace the stored token. `None` signs out.
    pub fn set(&self, token: Option<String>) {
        match self.0.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

impl CredentialProvider for SharedCredential {
    fn token(&self) -> Option<String> {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl fmt::Debug for SharedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedCredential").field(&"<redacted>").finish()
    }
}
