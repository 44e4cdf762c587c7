//! Id-ordered, duplicate-free message log of one session.
//!
//! Live messages that arrive before the history snapshot is merged are held
//! back and replayed, in arrival order, right after the merge.

use shared::{domain::MessageId, protocol::ChatMessage};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted { index: usize },
    Duplicate,
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMutation {
    /// The snapshot was applied; `count` is the log length afterwards.
    Seeded { count: usize },
    Inserted { id: MessageId, index: usize },
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("message log already seeded for this session")]
    AlreadySeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type LogCallback = Box<dyn FnMut(LogMutation, &[ChatMessage]) + Send>;

#[derive(Default)]
pub struct MessageLog {
    messages: Vec<ChatMessage>,
    seeded: bool,
    pending: Vec<ChatMessage>,
    subscribers: Vec<(SubscriptionId, LogCallback)>,
    next_subscription: u64,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_id(&self) -> Option<MessageId> {
        self.messages.last().map(|message| message.id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.position(id).is_ok()
    }

    /// Applies the history snapshot, then replays anything buffered while
    /// waiting for it.
    pub fn merge(&mut self, snapshot: Vec<ChatMessage>) -> Result<(), LogError> {
        if self.seeded {
            return Err(LogError::AlreadySeeded);
        }
        let mut snapshot = snapshot;
        snapshot.sort_by_key(|message| message.id);
        snapshot.dedup_by_key(|message| message.id);
        self.messages = snapshot;
        self.seeded = true;
        self.notify(LogMutation::Seeded {
            count: self.messages.len(),
        });

        let buffered = std::mem::take(&mut self.pending);
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "replaying live messages buffered before merge");
        }
        for message in buffered {
            self.append(message);
        }
        Ok(())
    }

    pub fn append(&mut self, message: ChatMessage) -> AppendOutcome {
        if !self.seeded {
            self.pending.push(message);
            return AppendOutcome::Buffered;
        }
        match self.position(message.id) {
            Ok(_) => {
                debug!(message_id = message.id.0, "ignoring duplicate message");
                AppendOutcome::Duplicate
            }
            Err(index) => {
                let id = message.id;
                self.messages.insert(index, message);
                self.notify(LogMutation::Inserted { id, index });
                AppendOutcome::Inserted { index }
            }
        }
    }

    /// Drops every message and the seeded flag; the log can be seeded again.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.pending.clear();
        self.seeded = false;
        self.notify(LogMutation::Cleared);
    }

    pub fn subscribe(
        &mut self,
        callback: impl FnMut(LogMutation, &[ChatMessage]) + Send + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(existing, _)| *existing != id);
        self.subscribers.len() != before
    }

    fn position(&self, id: MessageId) -> Result<usize, usize> {
        self.messages.binary_search_by_key(&id, |message| message.id)
    }

    fn notify(&mut self, mutation: LogMutation) {
        let messages = &self.messages;
        for (_, callback) in self.subscribers.iter_mut() {
            callback(mutation, messages);
        }
    }
}

#[cfg(test)]
#[path = "tests/message_log_tests.rs"]
mod tests;
