//! Parley Channels - Telegram front end for the Parley relay.
//!
//! ## Architecture
//!
//! ```text
//! Telegram → POST /webhook → queue → processor → RequestHandler → LLM
//!                                                     ↓
//! User ←──── sendMessage / editMessageText ←── TelegramChannel
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod bridge;
pub mod routes;
pub mod telegram;

pub use bridge::{spawn_processor, spawn_reaper};
pub use routes::{build_router, create_state, ChannelsState};
pub use telegram::TelegramChannel;

use anyhow::Context;
use parley_common::Config;
use parley_gateway::OpenAiCompatibleProvider;
use parley_memory::{build_handler, SessionStore, SystemClock};
use std::net::SocketAddr;
use std::sync::Arc;

/// Start the relay: verify the bot, register the webhook, serve HTTP, and
/// run the processor and reaper until Ctrl-C.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    let bot_token = config
        .telegram
        .bot_token
        .clone()
        .context("telegram.bot_token is not set (TELEGRAM_TOKEN)")?;
    let telegram = Arc::new(TelegramChannel::new(bot_token).with_api_base(&config.telegram.api_base));

    let me = telegram
        .get_me()
        .await
        .context("Telegram getMe failed; check TELEGRAM_TOKEN")?;
    tracing::info!(bot_id = me.id, username = ?me.username, "Telegram bot authenticated");

    match config.telegram.webhook_url() {
        Some(url) => telegram
            .set_webhook(&url, config.telegram.webhook_secret.as_deref())
            .await
            .context("Failed to register Telegram webhook")?,
        None => tracing::warn!("No public host configured; webhook not registered"),
    }

    let generator = Arc::new(OpenAiCompatibleProvider::from_config(&config.llm));
    let store = Arc::new(SessionStore::new(Arc::new(SystemClock)));
    let handler = Arc::new(build_handler(
        config,
        store.clone(),
        generator,
        telegram.clone(),
    ));

    let (state, rx) = create_state(config.telegram.webhook_secret.clone());
    let router = build_router(state);

    let processor_handle = spawn_processor(handler, rx);
    let reaper_handle = spawn_reaper(
        store,
        config.memory.session_ttl(),
        config.memory.reap_interval(),
    );

    tracing::info!(
        model = %config.llm.model,
        stream = config.llm.stream,
        "Starting Parley relay on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper_handle.abort();
    processor_handle.abort();
    tracing::info!("Parley relay stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
