//! Socket abstraction under [`RealtimeChannel`](crate::channel::RealtimeChannel).
//!
//! A [`Connection`] is a pair of queues: text frames to write, and an ordered
//! stream of [`TransportEvent`]s read off the socket. Tests build connections
//! by hand and push synthetic events into them.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, info};
use url::Url;

use crate::config::{TokenPlacement, DEFAULT_KEEPALIVE_INTERVAL_MS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("handshake rejected: {0}")]
    AuthRejected(String),
    #[error("connect failed: {0}")]
    Transport(String),
}

pub struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            reader: None,
        }
    }

    fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn outbound(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }

    /// `None` once the socket side is gone without a close event.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // the writer exits on its own once every outbound sender is gone
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Connection, ConnectError>;
}

pub struct WebSocketTransport {
    ws_url: Url,
    placement: TokenPlacement,
    keepalive: Option<Duration>,
}

impl WebSocketTransport {
    pub fn new(ws_url: Url, placement: TokenPlacement) -> Self {
        Self {
            ws_url,
            placement,
            keepalive: Some(Duration::from_millis(DEFAULT_KEEPALIVE_INTERVAL_MS)),
        }
    }

    /// Heartbeat period while the socket is otherwise idle; `None` disables it.
    ///
    /// The heartbeat is an unsolicited pong: the server only extends its read
    /// deadline from its pong handler and never pings on its own.
    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive = interval;
        self
    }

    fn build_request(
        &self,
        token: &str,
    ) -> Result<tungstenite::handshake::client::Request, ConnectError> {
        let mut url = self.ws_url.clone();
        if self.placement == TokenPlacement::Query {
            url.query_pairs_mut().append_pair("token", token);
        }
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectError::Transport(err.to_string()))?;
        if self.placement == TokenPlacement::Header {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| ConnectError::Transport(format!("invalid token header: {err}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, token: &str) -> Result<Connection, ConnectError> {
        let request = self.build_request(token)?;
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(map_handshake_error)?;
        info!(url = %self.ws_url, "websocket connected");

        let (mut writer, mut reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let mut keepalive = self.keepalive.map(|period| {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    text = outbound_rx.recv() => match text {
                        Some(text) => Message::Text(text),
                        None => break,
                    },
                    _ = heartbeat(&mut keepalive) => Message::Pong(Vec::new()),
                };
                if let Err(err) = writer.send(message).await {
                    debug!(%err, "websocket write failed");
                    return;
                }
            }
            let _ = writer.close().await;
        });

        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => TransportEvent::Frame(text),
                    Ok(Message::Close(close)) => {
                        let (code, reason) = match close {
                            Some(close) => (Some(u16::from(close.code)), close.reason.to_string()),
                            None => (None, String::new()),
                        };
                        let _ = inbound_tx.send(TransportEvent::Closed { code, reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = inbound_tx.send(TransportEvent::Error(err.to_string()));
                        return;
                    }
                };
                if inbound_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(TransportEvent::Closed {
                code: None,
                reason: "stream ended".into(),
            });
        });

        Ok(Connection::new(outbound_tx, inbound_rx).with_reader(reader_task))
    }
}

async fn heartbeat(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn map_handshake_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            ConnectError::AuthRejected(format!(
                "server refused websocket upgrade with {}",
                response.status()
            ))
        }
        other => ConnectError::Transport(other.to_string()),
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
