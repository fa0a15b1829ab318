//! Configuration validation for Parley.
//!
//! Provides validation logic for configuration fields to ensure
//! all required values are present and within valid ranges.

use thiserror::Error;

use crate::config::{
    Config, DeliveryConfig, LlmConfig, MemoryConfig, ObservabilityConfig, ServerConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: u16, field: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

/// Tokenizer names accepted by `memory.tokenizer`.
pub const KNOWN_TOKENIZERS: &[&str] = &["heuristic", "cl100k_base", "o200k_base"];

impl Config {
    /// Validate the tunables of every section.
    ///
    /// Secrets are not required here; see [`Config::validate_for_server`].
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.llm.validate() {
            errors.push(e);
        }
        if let Err(e) = self.memory.validate() {
            errors.push(e);
        }
        if let Err(e) = self.delivery.validate() {
            errors.push(e);
        }
        if let Err(e) = self.server.validate() {
            errors.push(e);
        }
        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }

        collapse(errors)
    }

    /// Validate everything needed to run the relay server, including secrets.
    pub fn validate_for_server(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.validate() {
            match e {
                ValidationError::Multiple(inner) => errors.extend(inner),
                other => errors.push(other),
            }
        }

        if is_blank(self.telegram.bot_token.as_deref()) {
            errors.push(ValidationError::MissingField {
                field: "telegram.bot_token (TELEGRAM_TOKEN)".into(),
            });
        }
        if is_blank(self.llm.api_key.as_deref()) {
            errors.push(ValidationError::MissingField {
                field: "llm.api_key (LLM_API_KEY)".into(),
            });
        }

        collapse(errors)
    }

    /// Load with environment overrides and validate for serving.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        let config = Self::load_with_env()?;
        config
            .validate_for_server()
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

fn collapse(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
    if errors.is_empty() {
        Ok(())
    } else if errors.len() == 1 {
        Err(errors.remove(0))
    } else {
        Err(ValidationError::Multiple(errors))
    }
}

impl Validate for LlmConfig {
    fn validate(&self) -> ValidationResult<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ValidationError::InvalidValue {
                field: "llm.temperature".into(),
                reason: "must be between 0.0 and 2.0".into(),
            });
        }
        if self.max_tokens == 0 {
            return Err(ValidationError::InvalidValue {
                field: "llm.max_tokens".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "llm.timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ValidationError::InvalidValue {
                field: "llm.base_url".into(),
                reason: "must start with http:// or https://".into(),
            });
        }
        Ok(())
    }
}

impl Validate for MemoryConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_context_tokens == 0 {
            return Err(ValidationError::InvalidValue {
                field: "memory.max_context_tokens".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.max_history_rounds == 0 {
            return Err(ValidationError::InvalidValue {
                field: "memory.max_history_rounds".into(),
                reason: "must keep at least one round".into(),
            });
        }
        if self.truncate_floor_chars == 0 {
            return Err(ValidationError::InvalidValue {
                field: "memory.truncate_floor_chars".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.reap_interval_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "memory.reap_interval_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if !(self.chars_per_token > 0.0 && self.chars_per_token.is_finite()) {
            return Err(ValidationError::InvalidValue {
                field: "memory.chars_per_token".into(),
                reason: "must be a positive number".into(),
            });
        }
        if !KNOWN_TOKENIZERS.contains(&self.tokenizer.as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "memory.tokenizer".into(),
                reason: format!("must be one of {}", KNOWN_TOKENIZERS.join(", ")),
            });
        }
        Ok(())
    }
}

impl Validate for DeliveryConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.chunk_chars == 0 {
            return Err(ValidationError::InvalidValue {
                field: "delivery.chunk_chars".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.edit_stride_chars == 0 {
            return Err(ValidationError::InvalidValue {
                field: "delivery.edit_stride_chars".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for ServerConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort {
                port: self.port,
                field: "server.port".into(),
            });
        }
        if self.host.parse::<std::net::IpAddr>().is_err() {
            return Err(ValidationError::InvalidValue {
                field: "server.host".into(),
                reason: format!("'{}' is not an IP address", self.host),
            });
        }
        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}
