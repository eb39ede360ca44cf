//! Narration backends: the one place that talks to a text-generation model.
//!
//! The generator in [`crate::pipeline::narrate`] only sees the
//! [`NarrationBackend`] trait, so retry and rotation logic can be tested with
//! in-memory fakes. Two production backends exist:
//!
//! * [`GeminiBackend`] — calls Gemini's `generateContent` REST endpoint with
//!   an explicit API key. One instance per key, which is what makes a
//!   multi-key credential pool possible.
//! * [`ProviderBackend`] — wraps any `edgequake_llm::LLMProvider`
//!   (OpenAI, Anthropic, Gemini, Ollama, …). The provider reads its single
//!   key from the environment.

use crate::error::{GenerationError, PipelineError};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, LlmError, ProviderFactory};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A text-generation call used to draft narrations.
///
/// Implementations must report throttling as
/// [`GenerationError::RateLimited`]; every other failure is treated as fatal
/// for the run.
pub trait NarrationBackend: Send + Sync {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, GenerationError>>;
}

/// Default Gemini model for narration.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Default model when the provider is auto-detected through edgequake-llm.
pub const DEFAULT_PROVIDER_MODEL: &str = "gpt-4.1-nano";

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

// ── Gemini REST ──────────────────────────────────────────────────────────────

/// Gemini `generateContent` client bound to one API key.
#[derive(Clone)]
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_output_tokens: u32,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
            temperature: 0.7,
            max_output_tokens: 512,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn with_max_output_tokens(mut self, n: u32) -> Self {
        self.max_output_tokens = n.max(1);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    async fn call(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: Some(prompt.to_string()),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Fatal(format!("request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GenerationError::Fatal(format!("reading response failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_gemini_failure(status, &text));
        }

        let parsed: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| GenerationError::Fatal(format!("invalid response JSON: {e}")))?;
        let content = parsed.text();
        if content.trim().is_empty() {
            return Err(GenerationError::Fatal(
                "model returned no text (blocked or empty candidate)".into(),
            ));
        }
        debug!("Gemini {} returned {} chars", self.model, content.len());
        Ok(content)
    }
}

impl NarrationBackend for GeminiBackend {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, GenerationError>> {
        Box::pin(self.call(prompt))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

impl GenerateResponse {
    /// Concatenated text of the first candidate's parts.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    status: Option<String>,
}

/// Map a non-success Gemini response onto the retry loop's two outcomes.
///
/// Only HTTP 429 or an API status of `RESOURCE_EXHAUSTED` count as rate
/// limits. The body text is never searched, since request ids and token
/// counts routinely contain "429".
fn classify_gemini_failure(status: reqwest::StatusCode, body: &str) -> GenerationError {
    let detail = format!("HTTP {status}: {body}");
    let exhausted = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|r| r.error.status)
        .is_some_and(|s| s == "RESOURCE_EXHAUSTED");
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || exhausted {
        GenerationError::RateLimited(detail)
    } else {
        GenerationError::Fatal(detail)
    }
}

/// Provider errors are typed; only the rate-limit variant is retried.
fn classify_provider_error(err: LlmError) -> GenerationError {
    match err {
        LlmError::RateLimited(detail) => GenerationError::RateLimited(detail),
        other => GenerationError::Fatal(other.to_string()),
    }
}

// ── edgequake-llm provider ───────────────────────────────────────────────────

/// Narration backend backed by an `edgequake_llm` provider.
#[derive(Clone)]
pub struct ProviderBackend {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
}

impl ProviderBackend {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            temperature: 0.7,
            max_tokens: 512,
        }
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn with_max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n.max(1);
        self
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }

    async fn call(&self, prompt: &str) -> Result<String, GenerationError> {
        let messages = vec![ChatMessage::user(prompt)];
        let options = self.options();
        match self.provider.chat(&messages, Some(&options)).await {
            Ok(response) => {
                debug!(
                    "Narration call: {} input tokens, {} output tokens",
                    response.prompt_tokens, response.completion_tokens
                );
                if response.content.trim().is_empty() {
                    Err(GenerationError::Fatal("model returned no text".into()))
                } else {
                    Ok(response.content)
                }
            }
            Err(e) => Err(classify_provider_error(e)),
        }
    }
}

impl NarrationBackend for ProviderBackend {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, GenerationError>> {
        Box::pin(self.call(prompt))
    }
}

/// Resolve an edgequake-llm provider, from most to least specific:
///
/// 1. explicit provider name (+ optional model)
/// 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`
/// 3. `OPENAI_API_KEY` present → OpenAI
/// 4. `ProviderFactory::from_env()` auto-detection
pub fn resolve_provider(
    provider_name: Option<&str>,
    model: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(name) = provider_name {
        return create_provider(name, model.unwrap_or(DEFAULT_PROVIDER_MODEL));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, model.unwrap_or(&env_model));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", model.unwrap_or(DEFAULT_PROVIDER_MODEL));
        }
    }

    let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
        PipelineError::InvalidConfig(format!(
            "No narration provider could be auto-detected from environment.\n\
            Pass Gemini keys, or set OPENAI_API_KEY / ANTHROPIC_API_KEY.\n\
            Error: {e}"
        ))
    })?;

    Ok(llm_provider)
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        PipelineError::InvalidConfig(format!("LLM provider '{name}' is not configured: {e}"))
    })
}

/// Parse a list of API keys.
///
/// Accepts a JSON array (`["k1", "k2"]`), a single-quoted list, or a
/// comma/newline separated list.
/// Blank entries are dropped.
pub fn parse_api_keys(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        if let Ok(keys) = serde_json::from_str::<Vec<String>>(trimmed) {
            return keys
                .into_iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }
    }
    trimmed
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split([',', '\n'])
        .map(|k| k.trim().trim_matches(['"', '\'']).to_string())
        .filter(|k| !k.is_empty())
        .collect()
}
