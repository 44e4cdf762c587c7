use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unauthorized: {0}")]
    Auth(String),
    #[error("realtime connection unavailable")]
    ConnectionUnavailable,
    #[error("invalid message: {0}")]
    Validation(String),
    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("session storage error: {0}")]
    Storage(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("chat session has ended")]
    SessionEnded,
}

impl ChatError {
    /// Auth failures end the session; the user has to sign in again.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Errors the user can recover from by retrying the same action.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::ConnectionUnavailable => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(value: reqwest::Error) -> Self {
        if value.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            return Self::Auth(value.to_string());
        }
        Self::Network(value.to_string())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(value: serde_json::Error) -> Self {
        Self::Storage(value.to_string())
    }
}
