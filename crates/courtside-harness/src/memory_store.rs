//! In-memory durable message store.
//!
//! [`MessageLog`] is the shared system of record. Each signed-in user talks to
//! it through a [`MemoryStore`] handle, which also carries fault injection:
//! failing writes, failing reloads and delayed reloads whose result is
//! captured before the delay, so a slow reload can come back stale.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use courtside_app::{MessageStore, StoreError};
use courtside_proto::{Message, MessageId, NewMessage, UserId};

use crate::lock;

#[derive(Debug, Default)]
struct LogState {
    messages: Vec<Message>,
    next_id: u64,
}

/// Shared durable message log.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    state: Arc<Mutex<LogState>>,
}

impl MessageLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store handle acting as `user`.
    pub fn store_for(&self, user: UserId) -> MemoryStore {
        MemoryStore { log: self.clone(), user, faults: Arc::default() }
    }

    /// Persist a message without any client involvement, e.g. one sent
    /// while the receiver was offline. Timestamps advance one second per
    /// message.
    pub fn append(&self, sender: UserId, receiver: UserId, content: &str) -> Message {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        let message = Message {
            id: MessageId(id),
            sender_id: sender,
            receiver_id: receiver,
            content: content.to_owned(),
            created_at: Some(sim_timestamp(id)),
            timestamp: None,
            read: false,
        };
        state.messages.push(message.clone());
        message
    }

    /// Every stored message, in creation order.
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.state).messages.clone()
    }

    /// Messages between `a` and `b`, in creation order.
    pub fn conversation(&self, a: UserId, b: UserId) -> Vec<Message> {
        lock(&self.state).messages.iter().filter(|m| m.is_between(a, b)).cloned().collect()
    }

    /// Stored record for `id`.
    pub fn get(&self, id: MessageId) -> Option<Message> {
        lock(&self.state).messages.iter().find(|m| m.id == id).cloned()
    }

    fn mark_read(&self, reader: UserId, sender: UserId) -> usize {
        let mut state = lock(&self.state);
        let mut marked = 0;
        for message in &mut state.messages {
            if message.sender_id == sender && message.receiver_id == reader && !message.read {
                message.read = true;
                marked += 1;
            }
        }
        marked
    }
}

/// Deterministic `created_at` for the `n`th stored message.
pub fn sim_timestamp(n: u64) -> DateTime<Utc> {
    let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default();
    base + chrono::Duration::seconds(n as i64)
}

#[derive(Debug, Default)]
struct Faults {
    failing_creates: u32,
    failing_lists: u32,
    list_delay: Option<Duration>,
    list_calls: usize,
    mark_read_calls: Vec<UserId>,
}

/// One user's view of a [`MessageLog`], implementing [`MessageStore`].
///
/// Clones share fault settings and call records.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    log: MessageLog,
    user: UserId,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryStore {
    /// Standalone store for `user` over a fresh log.
    pub fn new(user: UserId) -> Self {
        MessageLog::new().store_for(user)
    }

    /// Backing log.
    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// User this handle acts as.
    pub fn user(&self) -> UserId {
        self.user
    }

    /// Fail the next `count` writes with [`StoreError::Unavailable`].
    pub fn fail_next_creates(&self, count: u32) {
        lock(&self.faults).failing_creates = count;
    }

    /// Fail the next `count` reloads with [`StoreError::Unavailable`].
    pub fn fail_next_lists(&self, count: u32) {
        lock(&self.faults).failing_lists = count;
    }

    /// Hold every reload result for `delay` after reading the log.
    pub fn delay_lists(&self, delay: Option<Duration>) {
        lock(&self.faults).list_delay = delay;
    }

    /// Number of reloads requested so far.
    pub fn list_calls(&self) -> usize {
        lock(&self.faults).list_calls
    }

    /// Counterparts passed to `mark_read`, in call order.
    pub fn mark_read_calls(&self) -> Vec<UserId> {
        lock(&self.faults).mark_read_calls.clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        {
            let mut faults = lock(&self.faults);
            if faults.failing_creates > 0 {
                faults.failing_creates -= 1;
                return Err(StoreError::Unavailable("injected write failure".into()));
            }
        }

        if message.content.trim().is_empty() {
            return Err(StoreError::Rejected { status: 400, message: "empty content".into() });
        }

        Ok(self.log.append(self.user, message.receiver_id, &message.content))
    }

    async fn list_messages(&self, counterpart: UserId) -> Result<Vec<Message>, StoreError> {
        let delay = {
            let mut faults = lock(&self.faults);
            faults.list_calls += 1;
            if faults.failing_lists > 0 {
                faults.failing_lists -= 1;
                return Err(StoreError::Unavailable("injected reload failure".into()));
            }
            faults.list_delay
        };

        let messages = self.log.conversation(self.user, counterpart);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(messages)
    }

    async fn mark_read(&self, counterpart: UserId) -> Result<(), StoreError> {
        lock(&self.faults).mark_read_calls.push(counterpart);
        let marked = self.log.mark_read(self.user, counterpart);
        tracing::trace!(reader = %self.user, %counterpart, marked, "marked read");
        Ok(())
    }
}
