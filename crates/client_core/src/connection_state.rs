use tokio::sync::watch;

use crate::channel::{CloseReason, ConnectionState};

/// What the UI shows in its connection indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionView {
    pub connected: bool,
    /// A handshake is in flight, the first one included.
    pub connecting: bool,
    /// Waiting out a backoff delay after a lost or failed connection.
    pub reconnecting: bool,
}

impl From<ConnectionState> for ConnectionView {
    fn from(state: ConnectionState) -> Self {
        Self {
            connected: state == ConnectionState::Open,
            connecting: state == ConnectionState::Connecting,
            reconnecting: matches!(state, ConnectionState::Reconnecting { .. }),
        }
    }
}

/// Read-only view over the channel's lifecycle. Holds no state of its own.
#[derive(Clone)]
pub struct ConnectionStateMachine {
    rx: watch::Receiver<ConnectionState>,
}

impl ConnectionStateMachine {
    pub fn new(rx: watch::Receiver<ConnectionState>) -> Self {
        Self { rx }
    }

    pub fn state(&self) -> ConnectionState {
        *self.rx.borrow()
    }

    pub fn view(&self) -> ConnectionView {
        self.state().into()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn auth_rejected(&self) -> bool {
        self.state() == ConnectionState::Closed(CloseReason::AuthRejected)
    }

    /// Waits for the next transition; `None` once the channel is gone.
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_reflects_each_state() {
        let cases = [
            (ConnectionState::Idle, (false, false, false)),
            (ConnectionState::Connecting, (false, true, false)),
            (ConnectionState::Open, (true, false, false)),
            (
                ConnectionState::Reconnecting {
                    attempt: 2,
                    next_delay_ms: 2_000,
                },
                (false, false, true),
            ),
            (
                ConnectionState::Closed(CloseReason::UserInitiated),
                (false, false, false),
            ),
            (
                ConnectionState::Closed(CloseReason::AuthRejected),
                (false, false, false),
            ),
        ];
        for (state, (connected, connecting, reconnecting)) in cases {
            let view = ConnectionView::from(state);
            assert_eq!(view.connected, connected, "{state:?}");
            assert_eq!(view.connecting, connecting, "{state:?}");
            assert_eq!(view.reconnecting, reconnecting, "{state:?}");
        }
    }

    #[tokio::test]
    async fn follows_published_states() {
        let (tx, rx) = watch::channel(ConnectionState::Idle);
        let mut machine = ConnectionStateMachine::new(rx);
        assert!(!machine.is_open());

        tx.send_replace(ConnectionState::Open);
        assert_eq!(machine.changed().await, Some(ConnectionState::Open));
        assert!(machine.is_open());
        assert!(machine.view().connected);

        tx.send_replace(ConnectionState::Closed(CloseReason::AuthRejected));
        assert!(machine.auth_rejected());
        assert_eq!(
            machine.changed().await,
            Some(ConnectionState::Closed(CloseReason::AuthRejected))
        );

        drop(tx);
        assert_eq!(machine.changed().await, None);
    }
}
