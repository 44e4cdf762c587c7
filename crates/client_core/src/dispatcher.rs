use std::sync::Arc;

use shared::protocol::OutboundFrame;
use tracing::debug;

use crate::{
    channel::RealtimeChannel, connection_state::ConnectionStateMachine, error::ChatError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    /// Blank input; nothing was transmitted.
    Suppressed,
}

/// Gatekeeper between the composer and the realtime channel.
///
/// Never appends to the message log: the server echoes every accepted
/// message back to its author, and that echo is the only way in.
#[derive(Clone)]
pub struct OutboundDispatcher {
    channel: Arc<RealtimeChannel>,
    connection: ConnectionStateMachine,
    max_frame_bytes: usize,
}

impl OutboundDispatcher {
    pub fn new(
        channel: Arc<RealtimeChannel>,
        connection: ConnectionStateMachine,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            channel,
            connection,
            max_frame_bytes,
        }
    }

    pub fn send(&self, raw: &str) -> Result<DispatchOutcome, ChatError> {
        let content = raw.trim();
        if content.is_empty() {
            return Ok(DispatchOutcome::Suppressed);
        }
        if !self.connection.is_open() {
            return Err(ChatError::ConnectionUnavailable);
        }

        let frame = serde_json::to_string(&OutboundFrame {
            content: content.to_string(),
        })
        .map_err(|err| ChatError::Validation(err.to_string()))?;
        if frame.len() > self.max_frame_bytes {
            return Err(ChatError::Validation(format!(
                "message is {} bytes encoded, the limit is {}",
                frame.len(),
                self.max_frame_bytes
            )));
        }

        self.channel.send(frame)?;
        debug!(bytes = content.len(), "outbound message dispatched");
        Ok(DispatchOutcome::Sent)
    }

    /// Sends the composer text and clears it only once it was handed to the
    /// socket; on any error the draft is left as typed.
    pub fn send_draft(&self, draft: &mut String) -> Result<DispatchOutcome, ChatError> {
        let outcome = self.send(draft)?;
        if outcome == DispatchOutcome::Sent {
            draft.clear();
        }
        Ok(outcome)
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
