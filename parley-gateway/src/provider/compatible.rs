//! OpenAI-compatible chat completions provider.
//!
//! Works with any endpoint speaking `POST {base_url}/chat/completions`
//! (DeepSeek, OpenAI, Groq, Mistral, local servers, ...), in plain and
//! SSE-streamed mode.

use super::sse::{SseDecoder, SseEvent};
use super::ProviderError;
use async_trait::async_trait;
use futures_util::StreamExt;
use parley_common::util::truncate_with_ellipsis;
use parley_common::LlmConfig;
use parley_memory::{FragmentStream, GenerationError, GenerationParams, Generator, Message};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Characters of an error response body kept in the error message.
const ERROR_BODY_CHARS: usize = 300;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A provider that speaks the OpenAI-compatible chat completions API.
pub struct OpenAiCompatibleProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    client: Client,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f64,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    message: String,
}

impl OpenAiCompatibleProvider {
    /// Create a provider for `base_url` (including any version segment).
    pub fn new(name: &str, base_url: &str, api_key: Option<&str>, model: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(ToString::to_string),
            model: model.to_string(),
            timeout: Duration::from_secs(60),
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Create from LLM configuration.
    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(
            "openai-compatible",
            &config.base_url,
            config.api_key.as_deref(),
            &config.model,
        )
        .with_timeout(config.timeout())
    }

    /// Total request timeout for plain (non-streamed) calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn error(&self, model: &str, message: String, status_code: Option<u16>) -> ProviderError {
        ProviderError {
            provider: self.name.clone(),
            model: model.to_string(),
            message,
            status_code,
        }
    }

    /// Send a completion request and check the status.
    async fn send(
        &self,
        window: &[Message],
        params: &GenerationParams,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let model = params.model.as_deref().unwrap_or(&self.model);

        let api_key = self.api_key.as_deref().ok_or_else(|| {
            self.error(model, format!("{} API key not set", self.name), None)
        })?;

        let request = CompletionRequest {
            model,
            messages: window,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream,
        };

        let mut builder = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&request);
        if !stream {
            builder = builder.timeout(self.timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.error(model, format!("Request failed: {e}"), None))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.error(
                model,
                format!(
                    "API error ({}): {}",
                    status.as_u16(),
                    truncate_with_ellipsis(body.trim(), ERROR_BODY_CHARS)
                ),
                Some(status.as_u16()),
            ));
        }

        Ok(response)
    }
}

#[async_trait]
impl Generator for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        window: &[Message],
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let start = Instant::now();
        let model = params.model.as_deref().unwrap_or(&self.model);

        let response = self.send(window, params, false).await?;
        let result: CompletionResponse = response
            .json()
            .await
            .map_err(|e| self.error(model, format!("Failed to parse response: {e}"), None))?;

        let choice = result
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.error(model, format!("No response from {}", self.name), None))?;

        tracing::debug!(
            provider = %self.name,
            model = %model,
            messages = window.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Completion received"
        );
        Ok(choice.message.content.unwrap_or_default())
    }

    async fn generate_stream(
        &self,
        window: &[Message],
        params: &GenerationParams,
    ) -> Result<FragmentStream, GenerationError> {
        let response = self.send(window, params, true).await?;

        let provider = self.name.clone();
        let model = params.model.clone().unwrap_or_else(|| self.model.clone());
        let mut bytes = response.bytes_stream();

        let fragments = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            let mut finished = false;

            while !finished {
                let events = match bytes.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(e)) => {
                        yield Err(stream_error(&provider, &model, format!("Stream error: {e}")));
                        return;
                    }
                    None => {
                        finished = true;
                        decoder.finish().into_iter().collect()
                    }
                };

                for event in events {
                    match event {
                        SseEvent::Done => return,
                        SseEvent::Data(data) => match parse_chunk(&data) {
                            Ok(Some(fragment)) => yield Ok(fragment),
                            Ok(None) => {}
                            Err(message) => {
                                yield Err(stream_error(&provider, &model, message));
                                return;
                            }
                        },
                    }
                }
            }
        };

        Ok(fragments.boxed())
    }
}

fn stream_error(provider: &str, model: &str, message: String) -> GenerationError {
    ProviderError {
        provider: provider.to_string(),
        model: model.to_string(),
        message,
        status_code: None,
    }
    .into()
}

/// Extract the content delta of one stream chunk.
///
/// Unparseable chunks are skipped; an `error` object ends the stream.
fn parse_chunk(data: &str) -> Result<Option<String>, String> {
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable stream chunk");
            return Ok(None);
        }
    };

    if let Some(error) = chunk.error {
        return Err(format!("Stream error: {}", error.message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}
