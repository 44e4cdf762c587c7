use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use shared::{
    error::ApiError,
    protocol::{
        ChatMessage, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse, UserProfile,
    },
};
use tracing::debug;

use crate::{config::MAX_HISTORY_LIMIT, error::ChatError};

/// Fetches the bounded history snapshot that seeds a session's message log.
#[async_trait]
pub trait HistoryLoader: Send + Sync {
    /// Returns at most `limit` messages, ascending by id.
    async fn load(&self, token: &str, limit: u32) -> Result<Vec<ChatMessage>, ChatError>;
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    server_url: String,
}

#[derive(serde::Serialize)]
struct ListMessagesQuery {
    limit: u32,
}

impl ApiClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_http_client(Client::new(), server_url)
    }

    pub fn with_http_client(http: Client, server_url: impl Into<String>) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self { http, server_url }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<RegisterResponse, ChatError> {
        let res = self
            .http
            .post(format!("{}/api/register", self.server_url))
            .json(&RegisterRequest {
                email: email.to_string(),
                password: password.to_string(),
                display_name: display_name.to_string(),
            })
            .send()
            .await?;
        Ok(check_status(res).await?.json().await?)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ChatError> {
        let res = self
            .http
            .post(format!("{}/api/login", self.server_url))
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        Ok(check_status(res).await?.json().await?)
    }

    pub async fn me(&self, token: &str) -> Result<UserProfile, ChatError> {
        let res = self
            .http
            .get(format!("{}/api/me", self.server_url))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(check_status(res).await?.json().await?)
    }

    pub async fn list_messages(
        &self,
        token: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = limit.min(MAX_HISTORY_LIMIT);
        let res = self
            .http
            .get(format!("{}/api/messages", self.server_url))
            .bearer_auth(token)
            .query(&ListMessagesQuery { limit })
            .send()
            .await?;
        let mut messages: Vec<ChatMessage> = check_status(res).await?.json().await?;

        messages.sort_by_key(|message| message.id);
        messages.dedup_by_key(|message| message.id);
        if messages.len() > limit as usize {
            let excess = messages.len() - limit as usize;
            messages.drain(..excess);
        }
        debug!(count = messages.len(), limit, "history snapshot fetched");
        Ok(messages)
    }
}

#[async_trait]
impl HistoryLoader for ApiClient {
    async fn load(&self, token: &str, limit: u32) -> Result<Vec<ChatMessage>, ChatError> {
        self.list_messages(token, limit).await
    }
}

async fn check_status(res: Response) -> Result<Response, ChatError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let message = match res.json::<ApiError>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    };
    if status == StatusCode::UNAUTHORIZED {
        return Err(ChatError::Auth(message));
    }
    Err(ChatError::Api {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
