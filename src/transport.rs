//! The wire seam: a [`Transport`] capability the dispatch core calls into,
//! and the reqwest implementation against the Telegram Bot API.

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

/// Default Bot API host.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Remote messaging endpoint used by the notifier.
///
/// Implementations must report rate-limit rejections as
/// [`TransportError::Api`] with code 429 so the coordinator can re-queue the
/// dispatch instead of failing the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a new message in `chat_id`, returning the remote message id.
    async fn create_message(&self, chat_id: &str, text: &str) -> Result<i64, TransportError>;

    /// Replace the text of an existing message.
    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
    ) -> Result<(), TransportError>;
}

/// Telegram Bot API transport over HTTPS.
pub struct HttpTransport {
    client: reqwest::Client,
    bot_token: String,
    api_base: String,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(bot_token: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: bot_token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout,
        }
    }

    /// Override the Bot API base URL. Useful for local Bot API servers or
    /// testing against a mock.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// POST one Bot API method and validate the `ok` envelope. The whole
    /// round trip is bounded by the request timeout.
    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let url = self.api_url(method);

        let data: serde_json::Value = tokio::time::timeout(self.request_timeout, async {
            let resp = self.client.post(&url).json(&body).send().await?;
            resp.json().await
        })
        .await
        .map_err(|_| TransportError::Timeout(self.request_timeout))??;

        let ok = data
            .get("ok")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if !ok {
            let code = data
                .get("error_code")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or_default();
            let description = data
                .get("description")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown telegram api error")
                .to_string();
            tracing::debug!(target: "notigram", method, code, "bot api call rejected");
            return Err(TransportError::Api { code, description });
        }

        Ok(data)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create_message(&self, chat_id: &str, text: &str) -> Result<i64, TransportError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        let data = self.call("sendMessage", body).await?;
        data.pointer("/result/message_id")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| {
                TransportError::Malformed("sendMessage response missing result.message_id".into())
            })
    }

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
    ) -> Result<(), TransportError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "parse_mode": "HTML",
        });

        self.call("editMessageText", body).await?;
        Ok(())
    }
}
