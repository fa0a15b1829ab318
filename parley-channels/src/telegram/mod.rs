//! Telegram Bot API transport.
//!
//! Sends and edits plain-text messages and registers the webhook. Updates
//! arrive through the HTTP routes, not long polling.

use async_trait::async_trait;
use parley_common::util::sanitize_for_log;
use parley_memory::{DeliveryError, MessageHandle, Transport};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

/// Default Bot API base URL.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram's answer when an edit would leave the text unchanged.
const NOT_MODIFIED: &str = "message is not modified";

// ============================================================================
// API types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// The bot's own account, from `getMe`.
#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    pub id: i64,
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

// ============================================================================
// Telegram Channel
// ============================================================================

/// Telegram channel - delivers replies through the Bot API.
pub struct TelegramChannel {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    /// Create a new Telegram channel.
    pub fn new(bot_token: String) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the channel at another Bot API server.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Call a Bot API method and unwrap its `result`.
    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T, DeliveryError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Network(sanitize_for_log(&e.without_url().to_string())))?;

        let status = resp.status();
        let parsed: ApiResponse<T> = resp.json().await.map_err(|e| {
            if status.is_success() {
                DeliveryError::Network(format!("Telegram {method}: unreadable response: {}", e.without_url()))
            } else {
                DeliveryError::Rejected(format!("Telegram {method} failed with HTTP {}", status.as_u16()))
            }
        })?;

        if parsed.ok {
            return parsed
                .result
                .ok_or_else(|| DeliveryError::Rejected(format!("Telegram {method}: missing result")));
        }

        if status.as_u16() == 429 || parsed.error_code == Some(429) {
            return Err(DeliveryError::RateLimited {
                retry_after_secs: parsed
                    .parameters
                    .and_then(|p| p.retry_after)
                    .unwrap_or(1),
            });
        }

        Err(DeliveryError::Rejected(parsed.description.unwrap_or_else(|| {
            format!("Telegram {method} failed with HTTP {}", status.as_u16())
        })))
    }

    /// Send a text message. Returns the new message id.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, DeliveryError> {
        let body = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true
        });

        let sent: SentMessage = self.call("sendMessage", &body).await?;
        Ok(sent.message_id)
    }

    /// Edit the text of an existing message.
    ///
    /// An edit that would not change the text counts as success.
    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), DeliveryError> {
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "disable_web_page_preview": true
        });

        match self.call::<Value>("editMessageText", &body).await {
            Ok(_) => Ok(()),
            Err(DeliveryError::Rejected(description)) if description.contains(NOT_MODIFIED) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Register `url` as the bot's webhook.
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), DeliveryError> {
        let mut body = json!({
            "url": url,
            "allowed_updates": ["message"]
        });
        if let Some(secret) = secret {
            body["secret_token"] = json!(secret);
        }

        self.call::<Value>("setWebhook", &body).await?;
        tracing::info!(url = %url, "Telegram webhook registered");
        Ok(())
    }

    /// Verify the bot token.
    pub async fn get_me(&self) -> Result<BotUser, DeliveryError> {
        self.call("getMe", &json!({})).await
    }
}

#[async_trait]
impl Transport for TelegramChannel {
    async fn deliver_text(&self, chat_id: i64, text: &str) -> Result<MessageHandle, DeliveryError> {
        let message_id = self.send_message(chat_id, text).await?;
        Ok(MessageHandle {
            chat_id,
            message_id,
        })
    }

    async fn deliver_incremental_text(
        &self,
        handle: &MessageHandle,
        text: &str,
    ) -> Result<MessageHandle, DeliveryError> {
        self.edit_message_text(handle.chat_id, handle.message_id, text)
            .await?;
        Ok(handle.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_api_url() {
        let ch = TelegramChannel::new("123:ABC".into());
        assert_eq!(
            ch.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn api_base_override() {
        let ch = TelegramChannel::new("t".into()).with_api_base("http://127.0.0.1:9000/");
        assert_eq!(ch.api_url("sendMessage"), "http://127.0.0.1:9000/bott/sendMessage");
    }

    #[test]
    fn error_response_deserializes() {
        let json = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 7","parameters":{"retry_after":7}}"#;
        let parsed: ApiResponse<Value> = serde_json::from_str(json).unwrap();
        assert!(!parsed.ok);
        assert!(parsed.result.is_none());
        assert_eq!(parsed.parameters.and_then(|p| p.retry_after), Some(7));
    }
}
