//! LLM provider adapters.
//!
//! Providers implement [`parley_memory::Generator`] so the relay core never
//! sees HTTP details.

mod compatible;
pub mod sse;

pub use compatible::OpenAiCompatibleProvider;

use parley_memory::GenerationError;

/// Error from a provider.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.provider, self.model, self.message)
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for GenerationError {
    fn from(err: ProviderError) -> Self {
        tracing::warn!(
            provider = %err.provider,
            model = %err.model,
            status = ?err.status_code,
            "Provider call failed"
        );
        GenerationError::new(err.message)
    }
}
