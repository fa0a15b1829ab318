//! Reply assembly: run generation, deliver the result, record it.
//!
//! The assistant message is appended to the session buffer only after the
//! reply completed. Failed, timed-out and empty generations deliver a short
//! error message and leave the buffer as it was.

use crate::message::Message;
use crate::traits::{
    DeliveryError, GenerationError, GenerationParams, Generator, MessageHandle, Transport,
};
use futures_util::StreamExt;
use parley_common::util::take_chars;
use parley_common::{Config, DeliveryConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Characters of diagnostic shown to the user on failure.
const ERROR_DIAGNOSTIC_CHARS: usize = 200;

/// Shown while a streamed reply has no visible text yet.
const PLACEHOLDER: &str = "...";

// ============================================================================
// Edit policy
// ============================================================================

/// Decides when a streaming reply's live message is edited.
///
/// Short replies are edited on every fragment; longer ones only once they
/// have grown by `stride_chars` since the last attempted edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditPolicy {
    pub eager_below_chars: usize,
    pub stride_chars: usize,
}

impl Default for EditPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

impl EditPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            eager_below_chars: config.edit_eager_below_chars,
            stride_chars: config.edit_stride_chars.max(1),
        }
    }

    /// Whether to push an edit now that `accumulated_chars` have arrived,
    /// given the last attempt was made at `attempted_chars`. Failed attempts
    /// count, so a failing transport sees no more edits than a healthy one.
    pub fn should_edit(&self, accumulated_chars: usize, attempted_chars: usize) -> bool {
        if accumulated_chars <= attempted_chars {
            return false;
        }
        accumulated_chars < self.eager_below_chars
            || accumulated_chars - attempted_chars >= self.stride_chars
    }
}

// ============================================================================
// Reply state machine
// ============================================================================

/// Lifecycle of one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPhase {
    Idle,
    AwaitingFirstFragment,
    Streaming,
    Finalized,
    Errored,
}

/// Rejected phase transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid reply transition: {from:?} -> {to:?}")]
pub struct ReplyStateError {
    pub from: ReplyPhase,
    pub to: ReplyPhase,
}

impl ReplyPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Errored)
    }

    /// Allowed transitions. A whole (non-streamed) reply finalizes straight
    /// from `AwaitingFirstFragment`.
    pub fn can_transition(self, to: ReplyPhase) -> bool {
        use ReplyPhase::*;
        match (self, to) {
            (Idle, AwaitingFirstFragment)
            | (AwaitingFirstFragment, Streaming)
            | (AwaitingFirstFragment, Finalized)
            | (Streaming, Finalized) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn transition(self, to: ReplyPhase) -> Result<ReplyPhase, ReplyStateError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(ReplyStateError { from: self, to })
        }
    }
}

/// Outcome of one reply, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyReport {
    pub phase: ReplyPhase,
    /// New messages sent (reply chunks, seeds or error notices).
    pub delivered_segments: usize,
    pub edits: usize,
    pub failed_edits: usize,
    /// Characters recorded in history; zero unless finalized.
    pub reply_chars: usize,
}

impl Default for ReplyReport {
    fn default() -> Self {
        Self {
            phase: ReplyPhase::Idle,
            delivered_segments: 0,
            edits: 0,
            failed_edits: 0,
            reply_chars: 0,
        }
    }
}

impl ReplyReport {
    pub fn is_success(&self) -> bool {
        self.phase == ReplyPhase::Finalized
    }

    fn advance(&mut self, to: ReplyPhase) {
        match self.phase.transition(to) {
            Ok(phase) => self.phase = phase,
            Err(e) => tracing::error!(error = %e, "Reply state machine violated"),
        }
    }
}

/// Split `text` into `ceil(chars / chunk_chars)` pieces on char boundaries.
pub fn split_into_chunks(text: &str, chunk_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_chars.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn error_notice(error: &GenerationError) -> String {
    format!("❌ {}", take_chars(&error.message, ERROR_DIAGNOSTIC_CHARS))
}

// ============================================================================
// Assembler
// ============================================================================

/// Runs generation for a context window and delivers the reply.
pub struct ReplyAssembler {
    generator: Arc<dyn Generator>,
    transport: Arc<dyn Transport>,
    params: GenerationParams,
    timeout: Duration,
    streaming: bool,
    chunk_chars: usize,
    edit_policy: EditPolicy,
}

impl ReplyAssembler {
    pub fn new(
        generator: Arc<dyn Generator>,
        transport: Arc<dyn Transport>,
        params: GenerationParams,
        timeout: Duration,
    ) -> Self {
        let delivery = DeliveryConfig::default();
        Self {
            generator,
            transport,
            params,
            timeout,
            streaming: false,
            chunk_chars: delivery.chunk_chars,
            edit_policy: EditPolicy::from_config(&delivery),
        }
    }

    pub fn from_config(
        generator: Arc<dyn Generator>,
        transport: Arc<dyn Transport>,
        config: &Config,
    ) -> Self {
        Self::new(
            generator,
            transport,
            GenerationParams::from(&config.llm),
            config.llm.timeout(),
        )
        .with_streaming(config.llm.stream)
        .with_delivery(&config.delivery)
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_delivery(mut self, delivery: &DeliveryConfig) -> Self {
        self.chunk_chars = delivery.chunk_chars.max(1);
        self.edit_policy = EditPolicy::from_config(delivery);
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Generate a reply to `window`, deliver it to `chat_id`, and append it
    /// to `buffer` once complete.
    pub async fn respond(
        &self,
        chat_id: i64,
        window: &[Message],
        buffer: &mut Vec<Message>,
    ) -> ReplyReport {
        let report = if self.streaming {
            self.respond_streaming(chat_id, window, buffer).await
        } else {
            self.respond_once(chat_id, window, buffer).await
        };

        tracing::info!(
            chat_id,
            generator = %self.generator.name(),
            phase = ?report.phase,
            delivered = report.delivered_segments,
            edits = report.edits,
            failed_edits = report.failed_edits,
            reply_chars = report.reply_chars,
            "Reply finished"
        );
        report
    }

    async fn respond_once(
        &self,
        chat_id: i64,
        window: &[Message],
        buffer: &mut Vec<Message>,
    ) -> ReplyReport {
        let mut report = ReplyReport::default();
        report.advance(ReplyPhase::AwaitingFirstFragment);

        let result = match tokio::time::timeout(
            self.timeout,
            self.generator.generate(window, &self.params),
        )
        .await
        {
            Ok(Ok(text)) => non_empty(&text),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GenerationError::timeout(self.timeout.as_secs())),
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                self.fail(chat_id, None, &e, &mut report).await;
                return report;
            }
        };

        buffer.push(Message::assistant(reply.clone()));
        report.reply_chars = reply.chars().count();
        report.advance(ReplyPhase::Finalized);

        for chunk in split_into_chunks(&reply, self.chunk_chars) {
            match self.transport.deliver_text(chat_id, &chunk).await {
                Ok(_) => report.delivered_segments += 1,
                Err(e) => tracing::warn!(chat_id, error = %e, "Failed to deliver reply chunk"),
            }
        }
        report
    }

    async fn respond_streaming(
        &self,
        chat_id: i64,
        window: &[Message],
        buffer: &mut Vec<Message>,
    ) -> ReplyReport {
        let mut report = ReplyReport::default();
        report.advance(ReplyPhase::AwaitingFirstFragment);

        let mut stream = match tokio::time::timeout(
            self.timeout,
            self.generator.generate_stream(window, &self.params),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.fail(chat_id, None, &e, &mut report).await;
                return report;
            }
            Err(_) => {
                let e = GenerationError::timeout(self.timeout.as_secs());
                self.fail(chat_id, None, &e, &mut report).await;
                return report;
            }
        };

        let mut accumulated = String::new();
        let mut accumulated_chars = 0usize;
        // length at the last edit attempt, successful or not
        let mut attempted_chars = 0usize;
        let mut edits_paused_until: Option<Instant> = None;
        let mut live: Option<MessageHandle> = None;

        let outcome = loop {
            let fragment = match tokio::time::timeout(self.timeout, stream.next()).await {
                Err(_) => break Err(GenerationError::timeout(self.timeout.as_secs())),
                Ok(None) => break Ok(()),
                Ok(Some(Err(e))) => break Err(e),
                Ok(Some(Ok(fragment))) => fragment,
            };
            if fragment.is_empty() {
                continue;
            }

            accumulated.push_str(&fragment);
            accumulated_chars += fragment.chars().count();
            if report.phase == ReplyPhase::AwaitingFirstFragment {
                report.advance(ReplyPhase::Streaming);
            }

            let visible = take_chars(&accumulated, self.chunk_chars);
            match &live {
                None => {
                    let seed = if visible.trim().is_empty() {
                        PLACEHOLDER
                    } else {
                        visible
                    };
                    match self.transport.deliver_text(chat_id, seed).await {
                        Ok(handle) => {
                            live = Some(handle);
                            attempted_chars = accumulated_chars;
                            report.delivered_segments += 1;
                        }
                        Err(e) => {
                            tracing::warn!(chat_id, error = %e, "Failed to start streamed reply");
                        }
                    }
                }
                Some(handle) => {
                    if !self.edit_policy.should_edit(accumulated_chars, attempted_chars) {
                        continue;
                    }
                    if edits_paused_until.is_some_and(|until| Instant::now() < until) {
                        continue;
                    }

                    attempted_chars = accumulated_chars;
                    match self.transport.deliver_incremental_text(handle, visible).await {
                        Ok(_) => report.edits += 1,
                        Err(DeliveryError::RateLimited { retry_after_secs }) => {
                            report.failed_edits += 1;
                            edits_paused_until =
                                Instant::now().checked_add(Duration::from_secs(retry_after_secs));
                            tracing::warn!(chat_id, retry_after_secs, "Streaming edits rate limited");
                        }
                        Err(e) => {
                            report.failed_edits += 1;
                            tracing::warn!(chat_id, error = %e, "Streaming edit failed");
                        }
                    }
                }
            }
        };

        // streamed text is recorded exactly as received
        let reply = match outcome.and_then(|()| non_empty(&accumulated)) {
            Ok(_) => accumulated,
            Err(e) => {
                self.fail(chat_id, live.as_ref(), &e, &mut report).await;
                return report;
            }
        };

        let visible = take_chars(&reply, self.chunk_chars);
        match &live {
            Some(handle) => match self.transport.deliver_incremental_text(handle, visible).await {
                Ok(_) => report.edits += 1,
                Err(e) => {
                    report.failed_edits += 1;
                    tracing::warn!(chat_id, error = %e, "Final streaming edit failed");
                }
            },
            None => match self.transport.deliver_text(chat_id, visible).await {
                Ok(_) => report.delivered_segments += 1,
                Err(e) => tracing::warn!(chat_id, error = %e, "Failed to deliver streamed reply"),
            },
        }

        report.reply_chars = reply.chars().count();
        buffer.push(Message::assistant(reply));
        report.advance(ReplyPhase::Finalized);
        report
    }

    /// Show the failure to the user, in the live message when there is one.
    async fn fail(
        &self,
        chat_id: i64,
        live: Option<&MessageHandle>,
        error: &GenerationError,
        report: &mut ReplyReport,
    ) {
        tracing::warn!(chat_id, error = %error, "Generation failed");
        let notice = error_notice(error);

        if let Some(handle) = live {
            match self.transport.deliver_incremental_text(handle, &notice).await {
                Ok(_) => {
                    report.edits += 1;
                    report.advance(ReplyPhase::Errored);
                    return;
                }
                Err(e) => {
                    report.failed_edits += 1;
                    tracing::warn!(chat_id, error = %e, "Failed to show error in live message");
                }
            }
        }

        match self.transport.deliver_text(chat_id, &notice).await {
            Ok(_) => report.delivered_segments += 1,
            Err(e) => tracing::warn!(chat_id, error = %e, "Failed to deliver error notice"),
        }
        report.advance(ReplyPhase::Errored);
    }
}

fn non_empty(text: &str) -> Result<String, GenerationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(GenerationError::new("model returned an empty reply"))
    } else {
        Ok(trimmed.to_string())
    }
}
