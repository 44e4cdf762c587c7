use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{channel::BackoffPolicy, error::ChatError};

pub const DEFAULT_CONFIG_FILE: &str = "chat_client.toml";
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
/// The server silently falls back to 50 outside of this range.
pub const MAX_HISTORY_LIMIT: u32 = 200;
/// Matches the server's websocket read limit.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4096;
/// The server drops a socket that sends nothing for 60s.
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 25_000;

/// Where the session token travels on the websocket upgrade request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPlacement {
    /// `GET /ws?token=...`. Leaks into access logs, but it is what the server accepts today.
    #[default]
    Query,
    /// `Authorization: Bearer ...` on the upgrade request.
    Header,
}

impl TokenPlacement {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "query" => Some(Self::Query),
            "header" => Some(Self::Header),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    pub server_url: String,
    pub history_limit: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: u32,
    pub backoff_max_ms: u64,
    pub backoff_reset_after_ms: u64,
    pub max_frame_bytes: usize,
    /// Period of the websocket heartbeat; 0 turns it off.
    pub keepalive_interval_ms: u64,
    pub token_placement: TokenPlacement,
    pub session_file: PathBuf,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".into(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            backoff_base_ms: 1_000,
            backoff_multiplier: 2,
            backoff_max_ms: 30_000,
            backoff_reset_after_ms: 10_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            token_placement: TokenPlacement::Query,
            session_file: default_session_file(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    history_limit: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_multiplier: Option<u32>,
    backoff_max_ms: Option<u64>,
    backoff_reset_after_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
    keepalive_interval_ms: Option<u64>,
    token_placement: Option<TokenPlacement>,
    session_file: Option<PathBuf>,
}

impl ClientSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            multiplier: self.backoff_multiplier,
            max: Duration::from_millis(self.backoff_max_ms),
            reset_after: Duration::from_millis(self.backoff_reset_after_ms),
        }
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }

    pub fn history_limit(&self) -> u32 {
        self.history_limit.clamp(1, MAX_HISTORY_LIMIT)
    }

    /// `http(s)://host[:port][/prefix]` -> `ws(s)://host[:port]/ws`.
    pub fn ws_url(&self) -> Result<Url, ChatError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|err| ChatError::Config(format!("invalid server_url: {err}")))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(ChatError::Config(format!(
                    "server_url must start with http:// or https://, got {other}://"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ChatError::Config("failed to derive websocket url".into()))?;
        url.set_path("/ws");
        url.set_query(None);
        Ok(url)
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.backoff_base_ms == 0 {
            return Err(ChatError::Config("backoff_base_ms must be positive".into()));
        }
        if self.backoff_multiplier == 0 {
            return Err(ChatError::Config(
                "backoff_multiplier must be positive".into(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ChatError::Config(
                "backoff_max_ms must not be below backoff_base_ms".into(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(ChatError::Config("max_frame_bytes must be positive".into()));
        }
        self.ws_url().map(|_| ())
    }
}

pub fn load_settings() -> Result<ClientSettings, ChatError> {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE), |name| std::env::var(name).ok())
}

/// Defaults, then the optional TOML file, then environment overrides.
pub fn load_settings_from(
    config_file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ClientSettings, ChatError> {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(config_file) {
        let file_cfg: FileSettings = toml::from_str(&raw).map_err(|err| {
            ChatError::Config(format!("{}: {err}", config_file.display()))
        })?;
        apply_file_settings(&mut settings, file_cfg);
    }

    apply_env_overrides(&mut settings, env)?;
    settings.validate()?;
    Ok(settings)
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.history_limit {
        settings.history_limit = v;
    }
    if let Some(v) = file_cfg.backoff_base_ms {
        settings.backoff_base_ms = v;
    }
    if let Some(v) = file_cfg.backoff_multiplier {
        settings.backoff_multiplier = v;
    }
    if let Some(v) = file_cfg.backoff_max_ms {
        settings.backoff_max_ms = v;
    }
    if let Some(v) = file_cfg.backoff_reset_after_ms {
        settings.backoff_reset_after_ms = v;
    }
    if let Some(v) = file_cfg.max_frame_bytes {
        settings.max_frame_bytes = v;
    }
    if let Some(v) = file_cfg.keepalive_interval_ms {
        settings.keepalive_interval_ms = v;
    }
    if let Some(v) = file_cfg.token_placement {
        settings.token_placement = v;
    }
    if let Some(v) = file_cfg.session_file {
        settings.session_file = v;
    }
}

fn apply_env_overrides(
    settings: &mut ClientSettings,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), ChatError> {
    if let Some(v) = env("VITE_API_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("CHAT_HISTORY_LIMIT") {
        settings.history_limit = parse_env("CHAT_HISTORY_LIMIT", &v)?;
    }
    if let Some(v) = env("CHAT_BACKOFF_BASE_MS") {
        settings.backoff_base_ms = parse_env("CHAT_BACKOFF_BASE_MS", &v)?;
    }
    if let Some(v) = env("CHAT_BACKOFF_MULTIPLIER") {
        settings.backoff_multiplier = parse_env("CHAT_BACKOFF_MULTIPLIER", &v)?;
    }
    if let Some(v) = env("CHAT_BACKOFF_MAX_MS") {
        settings.backoff_max_ms = parse_env("CHAT_BACKOFF_MAX_MS", &v)?;
    }
    if let Some(v) = env("CHAT_BACKOFF_RESET_AFTER_MS") {
        settings.backoff_reset_after_ms = parse_env("CHAT_BACKOFF_RESET_AFTER_MS", &v)?;
    }
    if let Some(v) = env("CHAT_MAX_FRAME_BYTES") {
        settings.max_frame_bytes = parse_env("CHAT_MAX_FRAME_BYTES", &v)?;
    }
    if let Some(v) = env("CHAT_KEEPALIVE_INTERVAL_MS") {
        settings.keepalive_interval_ms = parse_env("CHAT_KEEPALIVE_INTERVAL_MS", &v)?;
    }
    if let Some(v) = env("CHAT_TOKEN_PLACEMENT") {
        settings.token_placement = TokenPlacement::parse(&v).ok_or_else(|| {
            ChatError::Config(format!("CHAT_TOKEN_PLACEMENT must be query or header, got {v}"))
        })?;
    }
    if let Some(v) = env("CHAT_SESSION_FILE") {
        settings.session_file = PathBuf::from(v);
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ChatError> {
    raw.trim()
        .parse()
        .map_err(|_| ChatError::Config(format!("{name} has an invalid value: {raw}")))
}

fn default_session_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chat_client")
        .join("session.json")
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
