//! # edgellm-router
//!
//! Hybrid inference routing and admission control over Tokio.
//!
//! ## Architecture
//!
//! Every request flows through a single dispatcher that composes the
//! routing primitives:
//! ```text
//! InferenceRequest → ResponseCache ─hit──────────────────────────────┐
//!                          │ miss                                    │
//!                          ▼                                         ▼
//!          RoutingDecisionEngine → cascade → CircuitBreaker → Backend → CostAccountant → Audit
//! ```
//!
//! Shared state (load samples, breakers, budget accounts, cache slots) is
//! synchronised per backend / per tenant / per key. No lock is ever held
//! across a backend invocation.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod audit;
pub mod backend;
pub mod budget;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod load;
pub mod metrics;
pub mod resilience;
pub mod routing;

// Re-exports for convenience
pub use audit::{AuditEvent, AuditOutcome, AuditRecorder};
pub use backend::{Backend, BackendRegistry, DataLocation, InferenceBackend, SimulatedBackend};
pub use budget::{BudgetLedger, BudgetStatus};
pub use catalog::{HealthReport, ModelInfo};
pub use config::{EngineConfig, SharedConfig};
pub use dispatcher::{DispatchError, RequestDispatcher};
pub use load::{LoadMonitor, LoadSnapshot};
pub use resilience::{BreakerSet, CircuitBreaker, CircuitStatus, ResponseCache};
pub use routing::{ComplexityScorer, RoutingDecision, RoutingDecisionEngine};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`RouterError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), RouterError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RouterError::Other(format!("tracing init failed: {e}")))
}

/// Top-level errors raised by backends and infrastructure.
///
/// Routing outcomes that are not faults (admission rejection, cascade
/// exhaustion) live in [`DispatchError`] instead.
#[derive(Error, Debug)]
pub enum RouterError {
    /// A backend call failed (network, API, or parsing error).
    #[error("backend {backend} failed: {reason}")]
    BackendFailure {
        /// Stable name of the backend that failed.
        backend: String,
        /// Human-readable failure cause.
        reason: String,
    },

    /// A backend call exceeded its per-call timeout.
    #[error("backend {backend} timed out after {timeout_ms}ms")]
    Timeout {
        /// Stable name of the backend that timed out.
        backend: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// A configuration value is missing or invalid (e.g., missing env var).
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Billing and budget unit issuing requests (department, client, or user).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(
    /// The raw tenant identifier.
    pub String,
);

impl TenantId {
    /// Create a new [`TenantId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Service class of a tenant; gates eligibility for the cloud fallback.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ServiceTier {
    /// Cost-optimised: served by local tiers unless they fail.
    #[default]
    Standard,
    /// May be routed to the cloud fallback for complex prompts.
    Premium,
}

impl ServiceTier {
    /// Stable lowercase name (`"standard"` / `"premium"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }
}

/// Sampling parameters forwarded to the backend.
///
/// Every field here affects model output and is therefore part of the
/// cache key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature (`0.0..=2.0`).
    pub temperature: f32,
    /// Optional nucleus sampling cutoff.
    pub top_p: Option<f32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: None,
        }
    }
}

/// An incoming inference request.
///
/// The prompt is assumed to have already passed the guardrail / PII
/// collaborator upstream of the dispatcher.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Unique identifier for trace correlation.
    pub request_id: String,
    /// Tenant the request is billed to.
    pub tenant: TenantId,
    /// Service tier of the tenant.
    pub tier: ServiceTier,
    /// Sanitised prompt text.
    pub prompt: String,
    /// Requested maximum output tokens.
    pub max_tokens: u32,
    /// Sampling parameters.
    pub params: SamplingParams,
    /// Explicit backend chosen by the operator or tenant; `None` means `auto`.
    pub model_override: Option<Backend>,
}

impl InferenceRequest {
    /// Create a request with default tier, sampling and token limit.
    ///
    /// A fresh UUID v4 is assigned as the request id.
    pub fn new(tenant: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            tenant: TenantId::new(tenant),
            tier: ServiceTier::Standard,
            prompt: prompt.into(),
            max_tokens: 1024,
            params: SamplingParams::default(),
            model_override: None,
        }
    }

    /// Set the service tier.
    pub fn with_tier(mut self, tier: ServiceTier) -> Self {
        self.tier = tier;
        self
    }

    /// Set the maximum output tokens.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.params.temperature = temperature;
        self
    }

    /// Pin the request to a specific backend.
    pub fn with_model(mut self, backend: Backend) -> Self {
        self.model_override = Some(backend);
        self
    }
}

/// Result returned to the caller of the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceResponse {
    /// Request id echoed from the [`InferenceRequest`].
    pub request_id: String,
    /// Generated text.
    pub text: String,
    /// Backend that produced the text.
    pub model_used: Backend,
    /// End-to-end latency as seen by the dispatcher.
    pub latency_ms: u64,
    /// Cost charged to the tenant for this request (zero on cache hits).
    pub cost: f64,
    /// Where the data was processed.
    pub data_location: DataLocation,
    /// Prompt tokens consumed.
    pub tokens_in: u64,
    /// Completion tokens produced.
    pub tokens_out: u64,
    /// Completion timestamp.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Whether the text was served from the response cache.
    pub cache_hit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_display_matches_inner() {
        let t = TenantId::new("acme");
        assert_eq!(t.to_string(), "acme");
        assert_eq!(t.as_str(), "acme");
    }

    #[test]
    fn test_request_builder_sets_fields() {
        let req = InferenceRequest::new("acme", "hello")
            .with_tier(ServiceTier::Premium)
            .with_max_tokens(64)
            .with_temperature(0.7)
            .with_model(Backend::CloudFallback);
        assert_eq!(req.tier, ServiceTier::Premium);
        assert_eq!(req.max_tokens, 64);
        assert!((req.params.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(req.model_override, Some(Backend::CloudFallback));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = InferenceRequest::new("t", "p");
        let b = InferenceRequest::new("t", "p");
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_service_tier_serde_lowercase() {
        let json = serde_json::to_string(&ServiceTier::Premium)
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: serialize: {e}")));
        assert_eq!(json, "\"premium\"");
    }
}
