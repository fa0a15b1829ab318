//! Token estimation for context budgeting.
//!
//! An exact BPE tokenizer is preferred. When it is not configured, cannot be
//! loaded, or rejects an input, counting falls back to a constant-ratio
//! character heuristic. Both paths are deterministic for identical input.

use crate::message::Message;
use lru::LruCache;
use parley_common::config::MemoryConfig;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tiktoken_rs::CoreBPE;
use xxhash_rust::xxh3::xxh3_64;

/// Entries kept in the per-content count cache.
const COUNT_CACHE_CAPACITY: usize = 4096;

/// Inputs larger than this skip the exact tokenizer.
const MAX_EXACT_INPUT_BYTES: usize = 1 << 20;

/// Token estimation error. Never surfaced past [`FallbackEstimator`].
#[derive(Debug, thiserror::Error)]
pub enum EstimationError {
    #[error("Tokenizer unavailable: {0}")]
    Unavailable(String),

    #[error("Tokenizer rejected input: {0}")]
    Rejected(String),
}

/// Converts a block of text into an integer token cost.
pub trait TokenEstimator: Send + Sync {
    /// Estimator name, for logs.
    fn name(&self) -> &str;

    /// Estimate the token cost of `text`.
    fn estimate(&self, text: &str) -> Result<usize, EstimationError>;
}

// ============================================================================
// Heuristic
// ============================================================================

/// `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicEstimator {
    chars_per_token: f64,
}

impl HeuristicEstimator {
    /// Create a heuristic estimator. Non-positive ratios fall back to 1.0.
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token > 0.0 && chars_per_token.is_finite() {
            chars_per_token
        } else {
            1.0
        };
        Self { chars_per_token }
    }

    /// Infallible count.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn count(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        (chars as f64 / self.chars_per_token).ceil() as usize
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn estimate(&self, text: &str) -> Result<usize, EstimationError> {
        Ok(self.count(text))
    }
}

// ============================================================================
// Exact (tiktoken)
// ============================================================================

/// Exact BPE token counts via `tiktoken-rs`.
pub struct TiktokenEstimator {
    encoding: String,
    bpe: CoreBPE,
}

impl TiktokenEstimator {
    /// Load a named encoding ("cl100k_base" or "o200k_base").
    pub fn new(encoding: &str) -> Result<Self, EstimationError> {
        let bpe = match encoding {
            "cl100k_base" => tiktoken_rs::cl100k_base(),
            "o200k_base" => tiktoken_rs::o200k_base(),
            other => {
                return Err(EstimationError::Unavailable(format!(
                    "unknown encoding '{other}'"
                )))
            }
        }
        .map_err(|e| EstimationError::Unavailable(e.to_string()))?;

        Ok(Self {
            encoding: encoding.to_string(),
            bpe,
        })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn name(&self) -> &str {
        &self.encoding
    }

    fn estimate(&self, text: &str) -> Result<usize, EstimationError> {
        if text.len() > MAX_EXACT_INPUT_BYTES {
            return Err(EstimationError::Rejected(format!(
                "{} bytes exceeds the exact-count limit",
                text.len()
            )));
        }
        Ok(self.bpe.encode_with_special_tokens(text).len())
    }
}

// ============================================================================
// Fallback
// ============================================================================

/// Exact-when-possible estimator with a heuristic fallback and a count cache.
pub struct FallbackEstimator {
    exact: Option<Box<dyn TokenEstimator>>,
    heuristic: HeuristicEstimator,
    cache: Mutex<LruCache<u64, usize>>,
}

impl FallbackEstimator {
    /// Heuristic-only estimator.
    pub fn heuristic(chars_per_token: f64) -> Self {
        Self::build(None, chars_per_token)
    }

    /// Use `exact` first and the heuristic whenever it fails.
    pub fn with_exact(exact: Box<dyn TokenEstimator>, chars_per_token: f64) -> Self {
        Self::build(Some(exact), chars_per_token)
    }

    /// Build from memory configuration. A tokenizer that fails to load is
    /// logged and replaced by the heuristic.
    pub fn from_config(config: &MemoryConfig) -> Self {
        if config.tokenizer == "heuristic" {
            return Self::heuristic(config.chars_per_token);
        }

        match TiktokenEstimator::new(&config.tokenizer) {
            Ok(exact) => {
                tracing::info!(tokenizer = %config.tokenizer, "Exact tokenizer loaded");
                Self::with_exact(Box::new(exact), config.chars_per_token)
            }
            Err(e) => {
                tracing::warn!(
                    tokenizer = %config.tokenizer,
                    error = %e,
                    "Tokenizer unavailable, using character heuristic"
                );
                Self::heuristic(config.chars_per_token)
            }
        }
    }

    fn build(exact: Option<Box<dyn TokenEstimator>>, chars_per_token: f64) -> Self {
        let capacity = NonZeroUsize::new(COUNT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            exact,
            heuristic: HeuristicEstimator::new(chars_per_token),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Token count of `text`; never fails.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let key = xxh3_64(text.as_bytes());
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(&hit) = cache.get(&key) {
                return hit;
            }
        }

        let count = self.count_uncached(text);

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, count);
        }
        count
    }

    fn count_uncached(&self, text: &str) -> usize {
        let Some(ref exact) = self.exact else {
            return self.heuristic.count(text);
        };

        match exact.estimate(text) {
            Ok(count) => count,
            Err(e) => {
                tracing::debug!(
                    estimator = %exact.name(),
                    error = %e,
                    "Exact estimation failed, using heuristic"
                );
                self.heuristic.count(text)
            }
        }
    }

    /// Total cost of a message sequence.
    pub fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count(&m.content)).sum()
    }

    /// Whether an exact tokenizer is active.
    pub fn is_exact(&self) -> bool {
        self.exact.is_some()
    }
}

impl TokenEstimator for FallbackEstimator {
    fn name(&self) -> &str {
        self.exact.as_ref().map_or("heuristic", |e| e.name())
    }

    fn estimate(&self, text: &str) -> Result<usize, EstimationError> {
        Ok(self.count(text))
    }
}

impl std::fmt::Debug for FallbackEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackEstimator")
            .field("estimator", &self.name())
            .field("heuristic", &self.heuristic)
            .finish()
    }
}
