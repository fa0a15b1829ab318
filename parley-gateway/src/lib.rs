//! Parley Gateway - text generation adapters for the Parley relay.
//!
//! Provides an OpenAI-compatible chat completions client implementing
//! [`parley_memory::Generator`], with plain and SSE-streamed replies.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod provider;

pub use provider::{OpenAiCompatibleProvider, ProviderError};
