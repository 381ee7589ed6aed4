//! Inference backend abstraction and implementations
//!
//! Provides the [`InferenceBackend`] trait, the closed set of [`Backend`]
//! targets the router can choose between, and two implementations:
//! - [`SimulatedBackend`]: deterministic in-process backend for tests and demos
//! - [`OpenAiCompatBackend`]: OpenAI-compatible `/chat/completions` server
//!   (Ollama for the local tiers, Groq or similar for the cloud fallback)
//!
//! ## Environment Variables
//!
//! - `OLLAMA_URL`: local OpenAI-compatible endpoint (default: http://localhost:11434/v1)
//! - `GROQ_API_KEY`: required for [`OpenAiCompatBackend::groq`]

use crate::config::{BackendProfile, BackendsConfig};
use crate::RouterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Backend identity
// ============================================================================

/// A concrete inference-serving target.
///
/// Declaration order is the fixed priority order used to break ties
/// (`LocalTierA < LocalTierB < CloudFallback`).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Fastest local model (small, cheap).
    LocalTierA,
    /// Secondary local model (larger, slower).
    LocalTierB,
    /// External cloud backend, tried least eagerly.
    CloudFallback,
}

impl Backend {
    /// All backends in priority order.
    pub const ALL: [Backend; 3] = [Self::LocalTierA, Self::LocalTierB, Self::CloudFallback];

    /// Stable name used in audit events and metric labels.
    pub fn name(self) -> &'static str {
        match self {
            Self::LocalTierA => "local-tier-a",
            Self::LocalTierB => "local-tier-b",
            Self::CloudFallback => "cloud-fallback",
        }
    }

    /// Parse a backend from its stable name or a model alias.
    ///
    /// Returns `None` for `"auto"` and unknown names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "local-tier-a" | "local_tier_a" | "phi4-mini" => Some(Self::LocalTierA),
            "local-tier-b" | "local_tier_b" | "mistral-7b" => Some(Self::LocalTierB),
            "cloud-fallback" | "cloud_fallback" | "cloud" => Some(Self::CloudFallback),
            _ => None,
        }
    }

    /// Whether the backend runs on local hardware.
    pub fn is_local(self) -> bool {
        !matches!(self, Self::CloudFallback)
    }

    /// Where request data is processed when served by this backend.
    pub fn data_location(self) -> DataLocation {
        if self.is_local() {
            DataLocation::OnPremise
        } else {
            DataLocation::Cloud
        }
    }

    /// Dense index into per-backend arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Static profile (cost rate, capacity) from the configuration.
    pub fn profile(self, backends: &BackendsConfig) -> &BackendProfile {
        match self {
            Self::LocalTierA => &backends.local_tier_a,
            Self::LocalTierB => &backends.local_tier_b,
            Self::CloudFallback => &backends.cloud_fallback,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Data residency tag attached to responses and audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataLocation {
    /// Processed on local hardware.
    OnPremise,
    /// Processed by an external provider.
    Cloud,
}

impl DataLocation {
    /// Stable tag (`"on-premise"` / `"cloud"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnPremise => "on-premise",
            Self::Cloud => "cloud",
        }
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// Parameters forwarded with every backend invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvokeParams {
    /// Maximum completion tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Optional nucleus sampling cutoff.
    pub top_p: Option<f32>,
}

/// Successful backend output.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutput {
    /// Generated text.
    pub text: String,
    /// Prompt tokens consumed.
    pub tokens_in: u64,
    /// Completion tokens produced.
    pub tokens_out: u64,
}

/// Trait for inference collaborators.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The dispatcher wraps every call in its own timeout as well; `timeout` is
/// passed through so HTTP clients can also bound the request on their side.
/// Dropping the returned future is a best-effort cancellation request.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Run inference on the given prompt.
    async fn invoke(
        &self,
        prompt: &str,
        params: &InvokeParams,
        timeout: Duration,
    ) -> Result<BackendOutput, RouterError>;
}

/// Maps each [`Backend`] to the collaborator that serves it.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<Backend, Arc<dyn InferenceBackend>>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the collaborator for a backend.
    pub fn with(mut self, backend: Backend, invoker: Arc<dyn InferenceBackend>) -> Self {
        self.backends.insert(backend, invoker);
        self
    }

    /// Look up the collaborator for a backend.
    pub fn get(&self, backend: Backend) -> Option<&Arc<dyn InferenceBackend>> {
        self.backends.get(&backend)
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether no backend has been registered.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.backends.keys().map(|b| b.name()).collect();
        names.sort_unstable();
        f.debug_struct("BackendRegistry")
            .field("backends", &names)
            .finish()
    }
}

// ============================================================================
// Simulated backend (testing / demo)
// ============================================================================

/// In-process backend with configurable latency and scripted failures.
///
/// Echoes a deterministic completion derived from the prompt. Token counts
/// are whitespace word counts, capped at `max_tokens` for the completion.
pub struct SimulatedBackend {
    name: String,
    delay: Duration,
    failing: AtomicBool,
    fail_next: AtomicU64,
    calls: AtomicU64,
}

impl SimulatedBackend {
    /// Create a simulated backend with the given label and latency.
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            failing: AtomicBool::new(false),
            fail_next: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Make every subsequent call fail (`true`) or succeed (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `n` calls, then recover.
    pub fn fail_next(&self, n: u64) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of times `invoke` has been entered.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for SimulatedBackend {
    async fn invoke(
        &self,
        prompt: &str,
        params: &InvokeParams,
        _timeout: Duration,
    ) -> Result<BackendOutput, RouterError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted || self.failing.load(Ordering::SeqCst) {
            return Err(RouterError::BackendFailure {
                backend: self.name.clone(),
                reason: format!("simulated failure on call {call}"),
            });
        }

        let tokens_in = prompt.split_whitespace().count() as u64;
        let tokens_out = tokens_in.min(u64::from(params.max_tokens));
        Ok(BackendOutput {
            text: format!("[{}] {}", self.name, prompt.trim()),
            tokens_in,
            tokens_out,
        })
    }
}

// ============================================================================
// OpenAI-compatible backend
// ============================================================================

/// Chat completions request payload
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Chat completions response
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Backend for any server exposing the OpenAI `/chat/completions` API.
///
/// ## Example
///
/// ```no_run
/// use edgellm_router::backend::OpenAiCompatBackend;
/// use std::sync::Arc;
///
/// let local = Arc::new(OpenAiCompatBackend::ollama("phi4-mini"));
/// ```
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatBackend {
    /// Create a backend for an arbitrary OpenAI-compatible base URL.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            model: model.into(),
        }
    }

    /// Local Ollama server.
    ///
    /// Reads `OLLAMA_URL`, defaulting to `http://localhost:11434/v1`.
    pub fn ollama(model: impl Into<String>) -> Self {
        let url = std::env::var("OLLAMA_URL")
            .unwrap_or_else(|_| "http://localhost:11434/v1".to_string());
        Self::new(url, model)
    }

    /// Groq cloud endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ConfigError`] if `GROQ_API_KEY` is not set.
    pub fn groq(model: impl Into<String>) -> Result<Self, RouterError> {
        let key = std::env::var("GROQ_API_KEY").map_err(|_| {
            RouterError::ConfigError("GROQ_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self::new("https://api.groq.com/openai/v1", model).with_api_key(key))
    }

    /// Attach a bearer token.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[async_trait]
impl InferenceBackend for OpenAiCompatBackend {
    async fn invoke(
        &self,
        prompt: &str,
        params: &InvokeParams,
        timeout: Duration,
    ) -> Result<BackendOutput, RouterError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(timeout)
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let failure = |reason: String| RouterError::BackendFailure {
            backend: self.model.clone(),
            reason,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| failure(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(failure(format!("API error {status}: {error_text}")));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| failure(format!("failed to parse response: {e}")))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| failure("no choices in response".to_string()))?;

        let (tokens_in, tokens_out) = match body.usage {
            Some(u) => (u.prompt_tokens, u.completion_tokens),
            None => (
                prompt.split_whitespace().count() as u64,
                text.split_whitespace().count() as u64,
            ),
        };

        Ok(BackendOutput {
            text,
            tokens_in,
            tokens_out,
        })
    }
}
