//! HTTP message store.
//!
//! Routes, relative to the API base URL:
//!
//! - `POST messages` creates a message
//! - `GET messages/{counterpart}` lists the conversation, oldest first
//! - `POST messages/{counterpart}/read` marks the counterpart's messages read
//!
//! Every request carries the current bearer token. A missing token fails
//! fast with [`StoreError::NotAuthenticated`] without touching the network.

use std::time::Duration;

use async_trait::async_trait;
use courtside_app::{MessageStore, StoreError};
use courtside_core::CredentialProvider;
use courtside_proto::{Message, NewMessage, UserId};
use reqwest::{Client, RequestBuilder, Response};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Durable message API client.
pub struct HttpStore<C> {
    client: Client,
    base_url: String,
    credentials: C,
}

impl<C: CredentialProvider> HttpStore<C> {
    /// Client for the API rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, credentials: C) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::with_client(client, base_url, credentials))
    }

    /// Client reusing an existing connection pool.
    pub fn with_client(client: Client, base_url: impl Into<String>, credentials: C) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { client, base_url, credentials }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, StoreError> {
        match self.credentials.token() {
            Some(token) if !token.is_empty() => Ok(request.bearer_auth(token)),
            _ => Err(StoreError::NotAuthenticated),
        }
    }
}

#[async_trait]
impl<C: CredentialProvider + 'static> MessageStore for HttpStore<C> {
    async fn create_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let request = self.authorized(self.client.post(self.url("messages")))?.json(&message);
        let response = execute(request).await?;
        response.json().await.map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn list_messages(&self, counterpart: UserId) -> Result<Vec<Message>, StoreError> {
        let request = self.authorized(self.client.get(self.url(&format!("messages/{counterpart}"))))?;
        let response = execute(request).await?;
        response.json().await.map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn mark_read(&self, counterpart: UserId) -> Result<(), StoreError> {
        let request =
            self.authorized(self.client.post(self.url(&format!("messages/{counterpart}/read"))))?;
        execute(request).await.map(|_| ())
    }
}

async fn execute(request: RequestBuilder) -> Result<Response, StoreError> {
    let response = request.send().await.map_err(|e| StoreError::Unavailable(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match response.text().await {
        Ok(body) if !body.is_empty() => body,
        _ => status.canonical_reason().unwrap_or_default().to_owned(),
    };
    tracing::debug!(status = status.as_u16(), %message, "store rejected request");
    Err(StoreError::Rejected { status: status.as_u16(), message })
}
