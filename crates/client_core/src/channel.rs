//! The single live connection of a chat session.
//!
//! One driver task per `open` owns the socket, runs the reconnect loop and
//! publishes every lifecycle change and inbound message on one ordered event
//! stream. Publishing goes through [`Shared`] under its generation number: a
//! driver whose generation was superseded by `open`/`close` can no longer
//! publish anything.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::protocol::ChatMessage;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    error::ChatError,
    transport::{ConnectError, Connection, Transport, TransportEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    UserInitiated,
    AuthRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Reconnecting {
        attempt: u32,
        next_delay_ms: u64,
    },
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    State(ConnectionState),
    Message(ChatMessage),
}

/// Exponential reconnect delay with a ceiling. Attempts are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: u32,
    pub max: Duration,
    /// A connection must stay open this long before the attempt counter resets.
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2,
            max: Duration::from_secs(30),
            reset_after: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.base;
        for _ in 1..attempt {
            if delay >= self.max {
                break;
            }
            delay = delay.saturating_mul(self.multiplier);
        }
        delay.min(self.max)
    }
}

struct Shared {
    generation: u64,
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    driver: Option<JoinHandle<()>>,
}

pub struct RealtimeChannel {
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    shared: Arc<Mutex<Shared>>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl RealtimeChannel {
    /// The receiver yields state changes and inbound messages in the order
    /// they happened.
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: BackoffPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let channel = Self {
            transport,
            policy,
            shared: Arc::new(Mutex::new(Shared {
                generation: 0,
                state: ConnectionState::Idle,
                outbound: None,
                driver: None,
            })),
            state_tx,
            events,
        };
        (channel, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Starts a fresh connection, tearing down whatever connection or pending
    /// reconnect timer existed before.
    pub fn open(&self, token: impl Into<String>) {
        let token = token.into();
        let mut guard = lock(&self.shared);
        let replaced = supersede(&mut guard);
        if replaced {
            info!("replacing existing realtime connection");
        }
        let generation = guard.generation;

        let publisher = Publisher {
            shared: Arc::clone(&self.shared),
            state_tx: self.state_tx.clone(),
            events: self.events.clone(),
            generation,
        };
        publisher.set_state_locked(&mut guard, ConnectionState::Connecting);

        let driver = Driver {
            transport: Arc::clone(&self.transport),
            policy: self.policy,
            token,
            publisher,
        };
        guard.driver = Some(tokio::spawn(driver.run()));
    }

    /// Terminal: no reconnect happens after this, even if the network recovers.
    /// An earlier auth rejection stays the reported close reason.
    pub fn close(&self) {
        let mut guard = lock(&self.shared);
        supersede(&mut guard);
        if !guard.state.is_terminal() {
            info!("realtime connection closed by user");
            guard.state = ConnectionState::Closed(CloseReason::UserInitiated);
            self.state_tx.send_replace(guard.state);
            let _ = self.events.send(ChannelEvent::State(guard.state));
        }
    }

    /// Writes one text frame. Never queues: fails unless the channel is open.
    pub fn send(&self, text: String) -> Result<(), ChatError> {
        let guard = lock(&self.shared);
        if guard.state != ConnectionState::Open {
            return Err(ChatError::ConnectionUnavailable);
        }
        let outbound = guard
            .outbound
            .as_ref()
            .ok_or(ChatError::ConnectionUnavailable)?;
        outbound
            .send(text)
            .map_err(|_| ChatError::ConnectionUnavailable)
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        supersede(&mut lock(&self.shared));
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Invalidates the running driver and drops its socket. Returns whether
/// there was one.
fn supersede(shared: &mut Shared) -> bool {
    shared.generation += 1;
    shared.outbound = None;
    match shared.driver.take() {
        Some(driver) => {
            driver.abort();
            true
        }
        None => false,
    }
}

struct Publisher {
    shared: Arc<Mutex<Shared>>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    generation: u64,
}

impl Publisher {
    /// Returns false once this driver has been superseded.
    fn set_state(&self, state: ConnectionState) -> bool {
        let mut guard = lock(&self.shared);
        self.set_state_locked(&mut guard, state)
    }

    fn set_state_locked(&self, guard: &mut Shared, state: ConnectionState) -> bool {
        if guard.generation != self.generation {
            return false;
        }
        if state != ConnectionState::Open {
            guard.outbound = None;
        }
        guard.state = state;
        self.state_tx.send_replace(state);
        let _ = self.events.send(ChannelEvent::State(state));
        true
    }

    fn set_open(&self, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut guard = lock(&self.shared);
        if guard.generation != self.generation {
            return false;
        }
        guard.outbound = Some(outbound);
        guard.state = ConnectionState::Open;
        self.state_tx.send_replace(ConnectionState::Open);
        let _ = self.events.send(ChannelEvent::State(ConnectionState::Open));
        true
    }

    fn deliver(&self, message: ChatMessage) -> bool {
        let guard = lock(&self.shared);
        if guard.generation != self.generation || guard.state != ConnectionState::Open {
            return false;
        }
        let _ = self.events.send(ChannelEvent::Message(message));
        true
    }
}

enum Disconnect {
    Unexpected(String),
    Superseded,
}

struct Driver {
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    token: String,
    publisher: Publisher,
}

impl Driver {
    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            match self.transport.connect(&self.token).await {
                Ok(connection) => {
                    let opened_at = Instant::now();
                    if !self.publisher.set_open(connection.outbound()) {
                        return;
                    }
                    info!(generation = self.publisher.generation, "realtime channel open");
                    match self.pump(connection).await {
                        Disconnect::Superseded => return,
                        Disconnect::Unexpected(reason) => {
                            warn!(%reason, "realtime connection lost");
                        }
                    }
                    if opened_at.elapsed() >= self.policy.reset_after {
                        attempt = 0;
                    }
                }
                Err(ConnectError::AuthRejected(reason)) => {
                    warn!(%reason, "realtime connection rejected; session is no longer valid");
                    self.publisher
                        .set_state(ConnectionState::Closed(CloseReason::AuthRejected));
                    return;
                }
                Err(ConnectError::Transport(reason)) => {
                    warn!(%reason, attempt, "realtime connect attempt failed");
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.policy.delay_for(attempt);
            let next_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            if !self.publisher.set_state(ConnectionState::Reconnecting {
                attempt,
                next_delay_ms,
            }) {
                return;
            }
            info!(attempt, next_delay_ms, "scheduling realtime reconnect");
            tokio::time::sleep(delay).await;
            if !self.publisher.set_state(ConnectionState::Connecting) {
                return;
            }
        }
    }

    async fn pump(&self, mut connection: Connection) -> Disconnect {
        loop {
            let event = match connection.recv().await {
                Some(event) => event,
                None => return Disconnect::Unexpected("transport went away".into()),
            };
            match event {
                TransportEvent::Frame(text) => match serde_json::from_str::<ChatMessage>(&text) {
                    Ok(message) => {
                        if !self.publisher.deliver(message) {
                            return Disconnect::Superseded;
                        }
                    }
                    Err(err) => {
                        warn!(%err, bytes = text.len(), "dropping malformed realtime frame");
                    }
                },
                TransportEvent::Closed { code, reason } => {
                    debug!(?code, %reason, "server closed realtime connection");
                    return Disconnect::Unexpected(format!("closed by server ({reason})"));
                }
                TransportEvent::Error(err) => return Disconnect::Unexpected(err),
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
