//! Background tasks connecting the webhook queue to the request handler.

use parley_common::logging::generate_trace_id;
use parley_memory::{HandleOutcome, IncomingMessage, RequestHandler, SessionStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

/// Drain the webhook queue, handling each message in its own task.
pub fn spawn_processor(
    handler: Arc<RequestHandler>,
    mut rx: mpsc::Receiver<IncomingMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Message processor started");

        while let Some(message) = rx.recv().await {
            let handler = handler.clone();
            let span = tracing::info_span!(
                "update",
                trace_id = %generate_trace_id(),
                user_id = %message.user_id,
                chat_id = message.chat_id,
            );

            tokio::spawn(
                async move {
                    match handler.handle(message).await {
                        HandleOutcome::Failed(report) => {
                            tracing::warn!(phase = ?report.phase, "Reply failed");
                        }
                        outcome => tracing::debug!(?outcome, "Message handled"),
                    }
                }
                .instrument(span),
            );
        }

        tracing::info!("Message processor stopped");
    })
}

/// Periodically drop sessions idle for longer than `ttl`.
pub fn spawn_reaper(
    store: Arc<SessionStore>,
    ttl: Duration,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            store.reap_idle(ttl);
        }
    })
}
