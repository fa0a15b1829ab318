//! Parley Memory - per-user conversation memory for a chat relay.
//!
//! This crate provides:
//! - Per-user session store with TTL reaping
//! - Token estimation (exact BPE with a character heuristic fallback)
//! - Context window assembly with escalating eviction
//! - Reply assembly for plain and streamed generations
//! - Request handling and bot commands
//!
//! Generation and delivery are reached through the [`Generator`] and
//! [`Transport`] traits; concrete adapters live in other crates.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod clock;
pub mod handler;
pub mod message;
pub mod reply;
pub mod store;
pub mod tokenizer;
pub mod traits;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use handler::{Command, HandleOutcome, IncomingMessage, RequestHandler};
pub use message::{Message, Role};
pub use reply::{EditPolicy, ReplyAssembler, ReplyPhase, ReplyReport, ReplyStateError};
pub use store::{SessionBusy, SessionGuard, SessionStats, SessionStore};
pub use tokenizer::{EstimationError, FallbackEstimator, TokenEstimator};
pub use traits::{
    DeliveryError, FragmentStream, GenerationError, GenerationParams, Generator, MessageHandle,
    Transport,
};
pub use window::{ContextWindow, ContextWindowBuilder, Eviction, WindowBudget};

use parley_common::Config;
use std::sync::Arc;

/// Wire a [`RequestHandler`] from configuration and the given collaborators.
pub fn build_handler(
    config: &Config,
    store: Arc<SessionStore>,
    generator: Arc<dyn Generator>,
    transport: Arc<dyn Transport>,
) -> RequestHandler {
    let estimator = Arc::new(FallbackEstimator::from_config(&config.memory));
    let builder = ContextWindowBuilder::from_config(estimator, &config.memory);
    let assembler = ReplyAssembler::from_config(generator, transport.clone(), config);
    RequestHandler::new(store, builder, assembler, transport)
}
