//! HTTP routes for the relay: health checks and the Telegram webhook.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use parley_memory::IncomingMessage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Header Telegram uses to echo the webhook secret.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Updates larger than this are rejected.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Capacity of the queue between the webhook and the processor.
const QUEUE_CAPACITY: usize = 100;

// ============================================================================
// State
// ============================================================================

/// Shared state for the relay HTTP server.
pub struct ChannelsState {
    /// Channel for forwarding incoming messages
    pub message_tx: mpsc::Sender<IncomingMessage>,
    /// Expected `X-Telegram-Bot-Api-Secret-Token`, if configured
    pub webhook_secret: Option<String>,
}

// ============================================================================
// Telegram Update Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
}

impl TelegramMessage {
    /// Sessions are keyed by sender; channel posts fall back to the chat.
    fn into_incoming(self) -> Option<IncomingMessage> {
        let text = self.text?;
        let user_id = self.from.map_or(self.chat.id, |u| u.id);
        Some(IncomingMessage::new(user_id.to_string(), self.chat.id, text))
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
struct WebhookResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl WebhookResponse {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

// ============================================================================
// Health Routes
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "parley",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ready(State(state): State<Arc<ChannelsState>>) -> impl IntoResponse {
    if state.message_tx.is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "not_ready",
                service: "parley",
                version: env!("CARGO_PKG_VERSION"),
            }),
        );
    }

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ready",
            service: "parley",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

// ============================================================================
// Telegram Webhook
// ============================================================================

async fn telegram_webhook(
    State(state): State<Arc<ChannelsState>>,
    headers: HeaderMap,
    Json(update): Json<TelegramUpdate>,
) -> impl IntoResponse {
    if let Some(ref expected) = state.webhook_secret {
        let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            tracing::warn!(update_id = update.update_id, "Rejected webhook with bad secret");
            return (
                StatusCode::UNAUTHORIZED,
                Json(WebhookResponse::error("Invalid secret token")),
            );
        }
    }

    tracing::debug!(update_id = update.update_id, "Telegram webhook received update");

    let Some(message) = update.message.and_then(TelegramMessage::into_incoming) else {
        return (StatusCode::OK, Json(WebhookResponse::ok()));
    };

    if let Err(e) = state.message_tx.send(message).await {
        tracing::error!("Failed to forward Telegram message: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(WebhookResponse::error("Message queue closed")),
        );
    }

    (StatusCode::OK, Json(WebhookResponse::ok()))
}

// ============================================================================
// Router Builder
// ============================================================================

/// Build the relay HTTP router.
pub fn build_router(state: Arc<ChannelsState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/webhook", post(telegram_webhook))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create the relay state with a message receiver.
pub fn create_state(
    webhook_secret: Option<String>,
) -> (Arc<ChannelsState>, mpsc::Receiver<IncomingMessage>) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

    let state = Arc::new(ChannelsState {
        message_tx: tx,
        webhook_secret: webhook_secret.filter(|s| !s.is_empty()),
    });

    (state, rx)
}
