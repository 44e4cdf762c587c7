//! A signed-in chat session.
//!
//! [`ChatSession::start`] opens the realtime channel, kicks off the history
//! load and spawns one pipeline task that owns the [`MessageLog`]. Commands
//! from the handle, history results and channel events are all handled on
//! that task, one at a time, so the log needs no lock.

use std::sync::Arc;

use shared::protocol::ChatMessage;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::HistoryLoader,
    channel::{ChannelEvent, CloseReason, ConnectionState, RealtimeChannel},
    config::ClientSettings,
    connection_state::ConnectionStateMachine,
    dispatcher::OutboundDispatcher,
    error::ChatError,
    message_log::{AppendOutcome, LogCallback, LogMutation, MessageLog, SubscriptionId},
    session_store::SessionStore,
    transport::Transport,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The snapshot was merged; `count` is the log length afterwards,
    /// including buffered live messages replayed on top of it.
    HistoryLoaded { count: usize },
    /// A history load failed. An unseeded log keeps buffering live messages;
    /// see [`ChatSession::retry_history`].
    HistoryFailed(String),
    /// History re-fetched after a reconnect; `added` messages had been
    /// missed while the connection was down.
    CaughtUp { added: usize },
    ConnectionChanged(ConnectionState),
    /// The server no longer accepts the token. Session data is already gone.
    AuthRejected,
    Ended,
}

enum Command {
    Subscribe(LogCallback, oneshot::Sender<SubscriptionId>),
    Unsubscribe(SubscriptionId, oneshot::Sender<bool>),
    Snapshot(oneshot::Sender<Vec<ChatMessage>>),
    RetryHistory,
    Logout(oneshot::Sender<Result<(), ChatError>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryLoad {
    /// Seeds the log through `merge`.
    Snapshot,
    /// Fills the gap of a reconnect through `append`.
    CatchUp,
}

type HistoryResult = (u64, HistoryLoad, Result<Vec<ChatMessage>, ChatError>);

pub struct ChatSession {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    store: Arc<SessionStore>,
    dispatcher: OutboundDispatcher,
    connection: ConnectionStateMachine,
}

impl ChatSession {
    /// Starts the session for the token currently held by `store`.
    ///
    /// Must be called inside a tokio runtime. The returned receiver sees
    /// every event from the start; later subscribers use
    /// [`subscribe_events`](Self::subscribe_events).
    pub fn start(
        store: Arc<SessionStore>,
        history: Arc<dyn HistoryLoader>,
        transport: Arc<dyn Transport>,
        settings: &ClientSettings,
    ) -> Result<(Self, broadcast::Receiver<SessionEvent>), ChatError> {
        let token = store
            .current_token()
            .ok_or_else(|| ChatError::Auth("not signed in".into()))?;

        let (channel, channel_events) = RealtimeChannel::new(transport, settings.backoff_policy());
        let channel = Arc::new(channel);
        let connection = ConnectionStateMachine::new(channel.watch_state());
        let dispatcher = OutboundDispatcher::new(
            Arc::clone(&channel),
            connection.clone(),
            settings.max_frame_bytes,
        );

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = broadcast::channel(EVENT_CAPACITY);
        let (history_tx, history_rx) = mpsc::unbounded_channel();

        let mut pipeline = Pipeline {
            log: MessageLog::new(),
            store: Arc::clone(&store),
            history,
            channel: Arc::clone(&channel),
            token: token.clone(),
            limit: settings.history_limit(),
            epoch: 0,
            history_task: None,
            history_tx,
            events: events.clone(),
        };
        pipeline.load_history(HistoryLoad::Snapshot);
        channel.open(token);
        tokio::spawn(pipeline.run(commands_rx, history_rx, channel_events));
        info!(display_name = ?store.display_name(), "chat session started");

        Ok((
            Self {
                commands,
                events,
                store,
                dispatcher,
                connection,
            },
            events_rx,
        ))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Registers a log observer. It runs on the pipeline task right after
    /// each mutation, so it must not block. If the log is already seeded the
    /// observer first gets a `Seeded` call with the current contents.
    pub async fn subscribe_log(
        &self,
        callback: impl FnMut(LogMutation, &[ChatMessage]) + Send + 'static,
    ) -> Result<SubscriptionId, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Subscribe(Box::new(callback), reply))?;
        rx.await.map_err(|_| ChatError::SessionEnded)
    }

    pub async fn unsubscribe_log(&self, id: SubscriptionId) -> Result<bool, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Unsubscribe(id, reply))?;
        rx.await.map_err(|_| ChatError::SessionEnded)
    }

    /// Copy of the log as it is right now.
    pub async fn messages(&self) -> Result<Vec<ChatMessage>, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot(reply))?;
        rx.await.map_err(|_| ChatError::SessionEnded)
    }

    /// Loads the snapshot again while the log is unseeded; once seeded, fetches
    /// the latest history to fill gaps. A load still in flight is abandoned.
    pub fn retry_history(&self) -> Result<(), ChatError> {
        self.command(Command::RetryHistory)
    }

    pub fn dispatcher(&self) -> &OutboundDispatcher {
        &self.dispatcher
    }

    pub fn connection(&self) -> ConnectionStateMachine {
        self.connection.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Closes the channel, drops the log and forgets the stored session.
    pub async fn logout(self) -> Result<(), ChatError> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Logout(reply)).is_err() {
            return self.store.clear_session();
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => self.store.clear_session(),
        }
    }

    fn command(&self, command: Command) -> Result<(), ChatError> {
        self.commands
            .send(command)
            .map_err(|_| ChatError::SessionEnded)
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Pipeline {
    log: MessageLog,
    store: Arc<SessionStore>,
    history: Arc<dyn HistoryLoader>,
    channel: Arc<RealtimeChannel>,
    token: String,
    limit: u32,
    /// Bumped by every load and by teardown; results tagged with an older
    /// value are dropped.
    epoch: u64,
    history_task: Option<JoinHandle<()>>,
    history_tx: mpsc::UnboundedSender<HistoryResult>,
    events: broadcast::Sender<SessionEvent>,
}

impl Pipeline {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut history_results: mpsc::UnboundedReceiver<HistoryResult>,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        loop {
            let flow = tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("session handle dropped; closing realtime channel");
                        self.cancel_history();
                        self.channel.close();
                        Flow::Stop
                    }
                },
                Some((epoch, load, result)) = history_results.recv() => {
                    self.on_history(epoch, load, result)
                }
                Some(event) = channel_events.recv() => self.on_channel_event(event),
                else => Flow::Stop,
            };
            if let Flow::Stop = flow {
                break;
            }
        }
        info!("chat session ended");
        let _ = self.events.send(SessionEvent::Ended);
    }

    fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Subscribe(mut callback, reply) => {
                if self.log.is_seeded() {
                    callback(
                        LogMutation::Seeded {
                            count: self.log.len(),
                        },
                        self.log.messages(),
                    );
                }
                let _ = reply.send(self.log.subscribe(callback));
            }
            Command::Unsubscribe(id, reply) => {
                let _ = reply.send(self.log.unsubscribe(id));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.log.messages().to_vec());
            }
            Command::RetryHistory => {
                if self.log.is_seeded() {
                    self.load_history(HistoryLoad::CatchUp);
                } else {
                    self.load_history(HistoryLoad::Snapshot);
                }
            }
            Command::Logout(reply) => {
                let result = self.teardown();
                info!("signed out");
                let _ = reply.send(result);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn on_history(
        &mut self,
        epoch: u64,
        load: HistoryLoad,
        result: Result<Vec<ChatMessage>, ChatError>,
    ) -> Flow {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "discarding stale history result");
            return Flow::Continue;
        }
        self.history_task = None;

        match result {
            Ok(recent) if load == HistoryLoad::CatchUp => {
                let fetched = recent.len();
                let mut added = 0;
                for message in recent {
                    if let AppendOutcome::Inserted { .. } = self.log.append(message) {
                        added += 1;
                    }
                }
                info!(fetched, added, "history caught up after reconnect");
                self.emit(SessionEvent::CaughtUp { added });
            }
            Ok(snapshot) => {
                let fetched = snapshot.len();
                match self.log.merge(snapshot) {
                    Ok(()) => {
                        let count = self.log.len();
                        info!(fetched, count, "history merged");
                        self.emit(SessionEvent::HistoryLoaded { count });
                    }
                    Err(err) => debug!(%err, "ignoring history result"),
                }
            }
            Err(err) if err.requires_reauth() => {
                warn!(%err, "history request rejected the session token");
                return self.reject_auth();
            }
            Err(err) => {
                warn!(%err, pending = self.log.pending_len(), "history load failed");
                self.emit(SessionEvent::HistoryFailed(err.to_string()));
            }
        }
        Flow::Continue
    }

    fn on_channel_event(&mut self, event: ChannelEvent) -> Flow {
        match event {
            ChannelEvent::Message(message) => {
                self.log.append(message);
            }
            ChannelEvent::State(state) => {
                self.emit(SessionEvent::ConnectionChanged(state));
                match state {
                    ConnectionState::Closed(CloseReason::AuthRejected) => {
                        return self.reject_auth();
                    }
                    // anything broadcast while the socket was down only exists in history
                    ConnectionState::Open if self.log.is_seeded() => {
                        self.load_history(HistoryLoad::CatchUp);
                    }
                    _ => {}
                }
            }
        }
        Flow::Continue
    }

    fn load_history(&mut self, load: HistoryLoad) {
        self.cancel_history();
        self.epoch += 1;
        let epoch = self.epoch;
        let history = Arc::clone(&self.history);
        let token = self.token.clone();
        let limit = self.limit;
        let results = self.history_tx.clone();
        debug!(epoch, limit, ?load, "loading message history");
        self.history_task = Some(tokio::spawn(async move {
            let result = history.load(&token, limit).await;
            let _ = results.send((epoch, load, result));
        }));
    }

    fn cancel_history(&mut self) {
        if let Some(task) = self.history_task.take() {
            task.abort();
        }
    }

    fn reject_auth(&mut self) -> Flow {
        if let Err(err) = self.teardown() {
            warn!(%err, "failed to forget rejected session");
        }
        self.emit(SessionEvent::AuthRejected);
        Flow::Stop
    }

    fn teardown(&mut self) -> Result<(), ChatError> {
        self.epoch += 1;
        self.cancel_history();

        let before = self.channel.state();
        self.channel.close();
        let after = self.channel.state();
        if after != before {
            self.emit(SessionEvent::ConnectionChanged(after));
        }

        self.log.clear();
        self.store.clear_session()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
