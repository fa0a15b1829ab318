//! Configuration management for Parley.
//!
//! The relay reads an optional JSON file at `~/.parley/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! ## Telegram
//! - `TELEGRAM_TOKEN` → telegram.bot_token
//! - `RENDER_EXTERNAL_HOSTNAME` → telegram.public_host
//! - `TELEGRAM_WEBHOOK_SECRET` → telegram.webhook_secret
//!
//! ## LLM
//! - `LLM_API_KEY` → llm.api_key
//! - `LLM_BASE_URL` → llm.base_url
//! - `MODEL_NAME` → llm.model
//! - `LLM_TEMPERATURE` → llm.temperature
//! - `LLM_MAX_TOKENS` → llm.max_tokens
//! - `STREAM_SWITCH` → llm.stream
//! - `LLM_TIMEOUT` → llm.timeout_secs (duration string)
//!
//! ## Memory
//! - `BOT_PERSONALITY` → memory.system_prompt
//! - `MAX_CONTEXT_TOKENS` → memory.max_context_tokens
//! - `MAX_HISTORY_ROUNDS` → memory.max_history_rounds
//! - `SESSION_TTL` → memory.session_ttl_secs (duration string)
//! - `TOKENIZER` → memory.tokenizer
//!
//! ## Server / logging
//! - `PORT` → server.port
//! - `PARLEY_LOG_LEVEL` → observability.log_level

use crate::error::{Error, Result, ResultExt};
use crate::util::parse_duration_secs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".parley"),
        |dirs| dirs.home_dir().join(".parley"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Telegram
// ============================================================================

/// Telegram Bot API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Public host name the webhook is reachable on (no scheme, no path).
    /// When unset the webhook is not registered at startup.
    #[serde(default)]
    pub public_host: Option<String>,

    /// Secret echoed by Telegram in `X-Telegram-Bot-Api-Secret-Token`
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Bot API base URL
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            public_host: None,
            webhook_secret: None,
            api_base: default_telegram_api_base(),
        }
    }
}

impl TelegramConfig {
    /// Full webhook URL, if a public host is configured.
    pub fn webhook_url(&self) -> Option<String> {
        self.public_host
            .as_deref()
            .map(|host| host.trim().trim_end_matches('/'))
            .filter(|host| !host.is_empty())
            .map(|host| format!("https://{host}/webhook"))
    }
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".into()
}

// ============================================================================
// LLM
// ============================================================================

/// OpenAI-compatible generation endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key sent as a bearer token
    #[serde(default)]
    pub api_key: Option<String>,

    /// Base URL including the version segment, e.g. `https://api.deepseek.com/v1`
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Model identifier
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Maximum output tokens per reply
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Stream replies with live message edits
    #[serde(default)]
    pub stream: bool,

    /// Generation timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            stream: false,
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl LlmConfig {
    /// Generation timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_llm_base_url() -> String {
    "https://api.deepseek.com/v1".into()
}

fn default_llm_model() -> String {
    "deepseek-chat".into()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_llm_timeout() -> u64 {
    60
}

// ============================================================================
// Memory
// ============================================================================

/// Per-user conversation memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// System preamble sent ahead of every context window
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Token budget for preamble + history
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// Maximum retained (user, assistant) rounds
    #[serde(default = "default_max_history_rounds")]
    pub max_history_rounds: usize,

    /// Characters kept when a single oversized message has to be cut
    #[serde(default = "default_truncate_floor")]
    pub truncate_floor_chars: usize,

    /// Idle time after which a session is reaped
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Period of the background reaper
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Token estimator: "heuristic", "cl100k_base" or "o200k_base"
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,

    /// Characters per token for the heuristic estimator
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_context_tokens: default_max_context_tokens(),
            max_history_rounds: default_max_history_rounds(),
            truncate_floor_chars: default_truncate_floor(),
            session_ttl_secs: default_session_ttl(),
            reap_interval_secs: default_reap_interval(),
            tokenizer: default_tokenizer(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

impl MemoryConfig {
    /// Session idle TTL as a duration.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Reaper period as a duration.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

fn default_system_prompt() -> String {
    "You are a clever and friendly assistant.".into()
}

fn default_max_context_tokens() -> usize {
    8000
}

fn default_max_history_rounds() -> usize {
    20
}

fn default_truncate_floor() -> usize {
    1000
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_reap_interval() -> u64 {
    60
}

fn default_tokenizer() -> String {
    "heuristic".into()
}

fn default_chars_per_token() -> f64 {
    1.5
}

// ============================================================================
// Delivery
// ============================================================================

/// Outbound delivery limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum characters per delivered message
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,

    /// Streaming: always edit while the reply is shorter than this
    #[serde(default = "default_edit_eager_below")]
    pub edit_eager_below_chars: usize,

    /// Streaming: afterwards, edit once the reply grew by this many characters
    #[serde(default = "default_edit_stride")]
    pub edit_stride_chars: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            edit_eager_below_chars: default_edit_eager_below(),
            edit_stride_chars: default_edit_stride(),
        }
    }
}

fn default_chunk_chars() -> usize {
    4000
}

fn default_edit_eager_below() -> usize {
    200
}

fn default_edit_stride() -> usize {
    100
}

// ============================================================================
// Server / Observability
// ============================================================================

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    10000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration for the relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .context(format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides applied.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Unset variables leave the current value alone; set but unparsable
    /// numeric values are reported as configuration errors.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Telegram
        if let Some(token) = lookup("TELEGRAM_TOKEN") {
            self.telegram.bot_token = Some(token);
        }
        if let Some(host) = lookup("RENDER_EXTERNAL_HOSTNAME") {
            self.telegram.public_host = Some(host);
        }
        if let Some(secret) = lookup("TELEGRAM_WEBHOOK_SECRET") {
            self.telegram.webhook_secret = Some(secret);
        }

        // LLM
        if let Some(key) = lookup("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = lookup("LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = lookup("MODEL_NAME") {
            self.llm.model = model;
        }
        if let Some(v) = lookup("LLM_TEMPERATURE") {
            self.llm.temperature = parse_number("LLM_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_number("LLM_MAX_TOKENS", &v)?;
        }
        if let Some(v) = lookup("STREAM_SWITCH") {
            self.llm.stream = v.trim().eq_ignore_ascii_case("true");
        }
        if let Some(v) = lookup("LLM_TIMEOUT") {
            self.llm.timeout_secs = parse_duration("LLM_TIMEOUT", &v)?;
        }

        // Memory
        if let Some(prompt) = lookup("BOT_PERSONALITY") {
            self.memory.system_prompt = prompt;
        }
        if let Some(v) = lookup("MAX_CONTEXT_TOKENS") {
            self.memory.max_context_tokens = parse_number("MAX_CONTEXT_TOKENS", &v)?;
        }
        if let Some(v) = lookup("MAX_HISTORY_ROUNDS") {
            self.memory.max_history_rounds = parse_number("MAX_HISTORY_ROUNDS", &v)?;
        }
        if let Some(v) = lookup("SESSION_TTL") {
            self.memory.session_ttl_secs = parse_duration("SESSION_TTL", &v)?;
        }
        if let Some(tokenizer) = lookup("TOKENIZER") {
            self.memory.tokenizer = tokenizer;
        }

        // Server / logging
        if let Some(v) = lookup("PORT") {
            self.server.port = parse_number("PORT", &v)?;
        }
        if let Some(level) = lookup("PARLEY_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(var: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{var} must be a number, got {value:?}")))
}

fn parse_duration(var: &str, value: &str) -> Result<u64> {
    parse_duration_secs(value).map_err(|e| Error::Config(format!("{var}: {e}")))
}
