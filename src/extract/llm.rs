//! LLM client: transport to the extraction model
//!
//! Two implementations:
//! - `OllamaClient`: HTTP `/api/generate` with JSON output (production)
//! - `MockClient`: returns scripted responses (testing)

use super::ExtractError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Errors from LLM client operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM endpoint not reachable: {0}")]
    Unavailable(String),
    #[error("LLM endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("LLM endpoint rate limited the request")]
    RateLimited { retry_after: Option<Duration> },
    #[error("LLM response could not be decoded: {0}")]
    InvalidResponse(String),
}

impl From<LlmError> for ExtractError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::RateLimited { retry_after } => ExtractError::RateLimited { retry_after },
            LlmError::InvalidResponse(msg) => ExtractError::Parse(msg),
            other => ExtractError::Transport(other.to_string()),
        }
    }
}

/// Client trait for calling a text-generation model.
///
/// Abstracts over transport (HTTP, mock) so the extractor doesn't depend on
/// how the model is reached.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion for `prompt`, returning the raw model text.
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    /// "json" forces structured output
    format: &'a str,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Client for an Ollama-compatible `/api/generate` endpoint
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    temperature: f32,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: 0.0,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(body.response)
    }
}

/// Mock client for testing. Plays back scripted responses in order.
///
/// Once the script is exhausted every call returns the fallback response, or
/// `Unavailable` if none was configured.
pub struct MockClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a successful response.
    pub fn with_response(self, response: impl Into<String>) -> Self {
        self.push(Ok(response.into()));
        self
    }

    /// Queue a failure.
    pub fn with_failure(self, error: LlmError) -> Self {
        self.push(Err(error));
        self
    }

    /// Response returned once the script runs out.
    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = Some(response.into());
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `generate` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(&self, entry: Result<String, LlmError>) {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(entry);
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockClient {
    async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        match next {
            Some(entry) => entry,
            None => self.fallback.clone().ok_or_else(|| {
                LlmError::Unavailable("mock client script exhausted".to_string())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_plays_script_then_fallback() {
        let client = MockClient::new()
            .with_response("first")
            .with_failure(LlmError::Unavailable("down".into()))
            .with_fallback("{}");

        assert_eq!(client.generate("p").await.unwrap(), "first");
        assert!(matches!(
            client.generate("p").await.unwrap_err(),
            LlmError::Unavailable(_)
        ));
        assert_eq!(client.generate("p").await.unwrap(), "{}");
        assert_eq!(client.generate("p").await.unwrap(), "{}");
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test]
    async fn mock_without_fallback_is_unavailable_when_exhausted() {
        let client = MockClient::new();
        let err = client.generate("p").await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
    }

    #[test]
    fn llm_errors_map_onto_extraction_taxonomy() {
        let rate: ExtractError = LlmError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        }
        .into();
        assert!(matches!(
            rate,
            ExtractError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(2)
        ));

        let http: ExtractError = LlmError::Http {
            status: 503,
            body: "busy".into(),
        }
        .into();
        assert!(matches!(http, ExtractError::Transport(_)));

        let decode: ExtractError = LlmError::InvalidResponse("bad body".into()).into();
        assert!(matches!(decode, ExtractError::Parse(_)));
    }

    #[test]
    fn ollama_base_url_is_normalized() {
        let client = OllamaClient::new("http://localhost:11434/", "llama3");
        assert_eq!(client.base_url, "http://localhost:11434");
        assert_eq!(client.model(), "llama3");
    }

    #[cfg(feature = "real_llm")]
    #[tokio::test]
    async fn ollama_generates_json() {
        let url = std::env::var("CHUNKGRAPH_LLM_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());
        let model = std::env::var("CHUNKGRAPH_LLM_MODEL").unwrap_or_else(|_| "llama3".to_string());
        let client = OllamaClient::new(url, model);

        let raw = client
            .generate(r#"Reply with the JSON object {"entities": []} and nothing else."#)
            .await
            .unwrap();
        assert!(crate::extract::extract_json(&raw).is_some());
    }
}
