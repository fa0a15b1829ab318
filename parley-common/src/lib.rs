//! Parley Common - Shared configuration, errors, and logging for the Parley relay.
//!
//! This crate provides:
//! - Configuration types and loading (file + environment overrides)
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup
//! - Small string utilities shared by the other crates

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::{
    Config, DeliveryConfig, LlmConfig, MemoryConfig, ObservabilityConfig, ServerConfig,
    TelegramConfig,
};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult};

