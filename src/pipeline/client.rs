//! Moderation endpoint client.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::FilterError;
use crate::pipeline::types::{FilterRequest, ModerationVerdict};

/// Classifies a message body. Any failure is a hard filter error, never
/// an implicit pass.
#[async_trait]
pub trait ModerationClient: Send + Sync {
    async fn classify(&self, message: &str) -> Result<ModerationVerdict, FilterError>;
}

/// `POST {"sms": ...}` to a moderation endpoint over HTTP.
pub struct HttpModerationClient {
    api_url: String,
    client: reqwest::Client,
}

impl HttpModerationClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModerationClient for HttpModerationClient {
    async fn classify(&self, message: &str) -> Result<ModerationVerdict, FilterError> {
        let resp = self
            .client
            .post(&self.api_url)
            .json(&FilterRequest { sms: message })
            .send()
            .await
            .map_err(|e| FilterError::Transport(e.to_string()))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Moderation endpoint rejected request");
            return Err(FilterError::Status {
                status: status.as_u16(),
            });
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FilterError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| FilterError::InvalidResponse(e.to_string()))
    }
}
