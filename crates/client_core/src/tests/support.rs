//! Scripted collaborators shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use shared::{
    domain::{MessageId, UserId},
    protocol::ChatMessage,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use crate::{
    api::HistoryLoader,
    error::ChatError,
    transport::{ConnectError, Connection, Transport, TransportEvent},
};

pub fn message(id: i64) -> ChatMessage {
    ChatMessage {
        id: MessageId(id),
        user_id: UserId(100 + id % 3),
        display_name: format!("user-{}", id % 3),
        content: format!("message {id}"),
        created_at: chrono::DateTime::from_timestamp(1_700_000_000 + id, 0).expect("timestamp"),
    }
}

pub fn ids(messages: &[ChatMessage]) -> Vec<i64> {
    messages.iter().map(|m| m.id.0).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Refuse,
    RejectAuth,
}

/// The server end of one scripted connection.
#[derive(Clone)]
pub struct ServerHandle {
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
}

impl ServerHandle {
    pub fn push_message(&self, message: &ChatMessage) {
        let text = serde_json::to_string(message).expect("encode");
        self.push_raw(text);
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Frame(text.into()));
    }

    pub fn hang_up(&self) {
        let _ = self.events.send(TransportEvent::Closed {
            code: Some(1006),
            reason: "abnormal closure".into(),
        });
    }

    pub fn fail(&self, err: &str) {
        let _ = self.events.send(TransportEvent::Error(err.to_string()));
    }

    /// True once the client dropped its side of this connection.
    pub fn is_dropped(&self) -> bool {
        self.events.is_closed()
    }

    pub fn drain_sent(&self) -> Vec<String> {
        let mut rx = self.sent.lock().expect("sent lock");
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

struct ScriptState {
    plan: VecDeque<Outcome>,
    fallback: Outcome,
    attempts: Vec<Instant>,
    tokens: Vec<String>,
    servers: Vec<ServerHandle>,
}

#[derive(Clone)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new(plan: impl IntoIterator<Item = Outcome>, fallback: Outcome) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                plan: plan.into_iter().collect(),
                fallback,
                attempts: Vec::new(),
                tokens: Vec::new(),
                servers: Vec::new(),
            })),
        }
    }

    pub fn accepting() -> Self {
        Self::new([], Outcome::Accept)
    }

    pub fn refusing() -> Self {
        Self::new([], Outcome::Refuse)
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().expect("script lock").attempts.len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.state.lock().expect("script lock").attempts.clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.state.lock().expect("script lock").tokens.clone()
    }

    pub fn server(&self, index: usize) -> ServerHandle {
        self.state.lock().expect("script lock").servers[index].clone()
    }

    pub fn latest_server(&self) -> ServerHandle {
        self.state
            .lock()
            .expect("script lock")
            .servers
            .last()
            .cloned()
            .expect("at least one accepted connection")
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, token: &str) -> Result<Connection, ConnectError> {
        let mut state = self.state.lock().expect("script lock");
        state.attempts.push(Instant::now());
        state.tokens.push(token.to_string());
        let outcome = state.plan.pop_front().unwrap_or(state.fallback);
        match outcome {
            Outcome::Refuse => Err(ConnectError::Transport("connection refused".into())),
            Outcome::RejectAuth => Err(ConnectError::AuthRejected("401 Unauthorized".into())),
            Outcome::Accept => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                state.servers.push(ServerHandle {
                    events: events_tx,
                    sent: Arc::new(Mutex::new(outbound_rx)),
                });
                Ok(Connection::new(outbound_tx, events_rx))
            }
        }
    }
}

/// History loader whose responses are released by the test.
#[derive(Clone, Default)]
pub struct GatedHistory {
    pending: Arc<Mutex<VecDeque<oneshot::Sender<Result<Vec<ChatMessage>, ChatError>>>>>,
    calls: Arc<Mutex<Vec<(String, u32)>>>,
}

impl GatedHistory {
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn waiting(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }

    /// Completes the oldest outstanding load.
    pub fn respond(&self, result: Result<Vec<ChatMessage>, ChatError>) {
        let tx = self
            .pending
            .lock()
            .expect("pending lock")
            .pop_front()
            .expect("a load is waiting");
        let _ = tx.send(result);
    }
}

#[async_trait]
impl HistoryLoader for GatedHistory {
    async fn load(&self, token: &str, limit: u32) -> Result<Vec<ChatMessage>, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.calls
            .lock()
            .expect("calls lock")
            .push((token.to_string(), limit));
        self.pending.lock().expect("pending lock").push_back(tx);
        rx.await
            .unwrap_or_else(|_| Err(ChatError::Network("load abandoned".into())))
    }
}
