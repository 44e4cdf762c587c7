//! Realtime session core of the chat client.
//!
//! A [`ChatSession`] reconciles the REST history snapshot with the websocket
//! push stream into one ordered, duplicate-free [`MessageLog`], tracks the
//! health of the single live connection and gates outbound sends.

pub mod api;
pub mod channel;
pub mod config;
pub mod connection_state;
pub mod dispatcher;
pub mod error;
pub mod message_log;
pub mod session;
pub mod session_store;
pub mod transport;

pub use api::{ApiClient, HistoryLoader};
pub use channel::{BackoffPolicy, ChannelEvent, CloseReason, ConnectionState, RealtimeChannel};
pub use config::{load_settings, ClientSettings, TokenPlacement};
pub use connection_state::{ConnectionStateMachine, ConnectionView};
pub use dispatcher::{DispatchOutcome, OutboundDispatcher};
pub use error::ChatError;
pub use message_log::{AppendOutcome, LogMutation, MessageLog, SubscriptionId};
pub use session::{ChatSession, SessionEvent};
pub use session_store::{FileSessionBackend, MemorySessionBackend, Session, SessionStore};
pub use transport::{Transport, WebSocketTransport};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
