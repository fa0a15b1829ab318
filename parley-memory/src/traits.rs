//! Collaborator traits: text generation and message delivery.

use crate::message::Message;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

// ============================================================================
// Generation
// ============================================================================

/// Generation failure. Surfaced to the user, never recorded in history.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct GenerationError {
    pub message: String,
}

impl GenerationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The generation did not finish within `secs` seconds.
    pub fn timeout(secs: u64) -> Self {
        Self::new(format!("generation timed out after {secs}s"))
    }
}

/// Sampling parameters passed with every generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Overrides the generator's configured model when set.
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.7,
            max_tokens: 2000,
        }
    }
}

impl From<&parley_common::LlmConfig> for GenerationParams {
    fn from(config: &parley_common::LlmConfig) -> Self {
        Self {
            model: Some(config.model.clone()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// Stream of reply fragments.
pub type FragmentStream = BoxStream<'static, Result<String, GenerationError>>;

/// Chat-completion backend.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generator name, for logs.
    fn name(&self) -> &str;

    /// Produce the full reply for `window`.
    async fn generate(
        &self,
        window: &[Message],
        params: &GenerationParams,
    ) -> Result<String, GenerationError>;

    /// Produce the reply as a stream of fragments.
    async fn generate_stream(
        &self,
        window: &[Message],
        params: &GenerationParams,
    ) -> Result<FragmentStream, GenerationError>;
}

// ============================================================================
// Delivery
// ============================================================================

/// Handle to a delivered message that can later be edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub chat_id: i64,
    pub message_id: i64,
}

/// Delivery failure. Logged and ignored by the core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Delivery rejected: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Outbound message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a new message to `chat_id`.
    async fn deliver_text(&self, chat_id: i64, text: &str) -> Result<MessageHandle, DeliveryError>;

    /// Replace the text of a previously delivered message.
    async fn deliver_incremental_text(
        &self,
        handle: &MessageHandle,
        text: &str,
    ) -> Result<MessageHandle, DeliveryError>;
}
