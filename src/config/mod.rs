//! # Stage: Engine Configuration
//!
//! ## Responsibility
//! Parse, validate, and hot-reload the TOML configuration that tunes the
//! routing engine: complexity thresholds, load saturation, breaker policy,
//! cache sizing, per-tier budget allowances and backend cost rates.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `EngineConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Late-bound: components read the current snapshot from [`SharedConfig`]
//!   on every operation, so a reload takes effect on the next request
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Routing policy itself (that belongs to `routing`)
//! - Owning runtime state such as budgets or breaker state

pub mod loader;
pub mod validation;
pub mod watcher;

use std::sync::Arc;

use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::routing::config::RoutingConfig;

// ── Default value functions ──────────────────────────────────────────────

/// Default EMA half-life for backend load: 5 seconds.
fn default_half_life_ms() -> u64 {
    5_000
}

/// Default consecutive-failure threshold before a breaker opens.
fn default_consecutive_failures() -> u32 {
    5
}

/// Default sliding window size for breaker failure counting.
fn default_window_size() -> usize {
    20
}

/// Default number of failures within the window that opens a breaker.
fn default_window_failures() -> usize {
    10
}

/// Default breaker cooldown before a half-open probe: 30 seconds.
fn default_cooldown_ms() -> u64 {
    30_000
}

/// Default cache TTL: 1 hour.
fn default_cache_ttl_secs() -> u64 {
    3_600
}

/// Default cache capacity: 10 000 entries.
fn default_cache_capacity() -> usize {
    10_000
}

/// Default per-period allowance for standard tenants (USD).
fn default_standard_allowance() -> f64 {
    5.0
}

/// Default per-period allowance for premium tenants (USD).
fn default_premium_allowance() -> f64 {
    100.0
}

/// Default per-call backend timeout: 30 seconds.
fn default_invoke_timeout_ms() -> u64 {
    30_000
}

/// Default audit channel capacity.
fn default_audit_capacity() -> usize {
    1_024
}

/// Default enabled state: true.
fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a router instance.
///
/// Every section is optional in TOML; missing sections take their defaults.
///
/// # Example
///
/// ```toml
/// [routing]
/// low_complexity_threshold = 0.3
///
/// [breaker]
/// cooldown_ms = 10000
///
/// [budget.premium]
/// period_allowance = 250.0
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Complexity and load thresholds for the decision rules.
    pub routing: RoutingConfig,
    /// Load monitor decay settings.
    pub load: LoadConfig,
    /// Circuit breaker policy shared by every backend.
    pub breaker: BreakerConfig,
    /// Response cache sizing.
    pub cache: CacheConfig,
    /// Per-tier budget refill policy.
    pub budget: BudgetConfig,
    /// Static backend profiles (cost rates, capacity hints, model ids).
    pub backends: BackendsConfig,
    /// Dispatcher timeouts and audit plumbing.
    pub dispatch: DispatchConfig,
}

// ── Load ─────────────────────────────────────────────────────────────────

/// Load monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LoadConfig {
    /// Half-life (ms) of the busy-time exponential moving average.
    #[serde(default = "default_half_life_ms")]
    pub half_life_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            half_life_ms: default_half_life_ms(),
        }
    }
}

// ── Breaker ──────────────────────────────────────────────────────────────

/// Circuit breaker policy.
///
/// A breaker opens when either trigger fires: `consecutive_failures` in a
/// row, or `window_failures` failures among the last `window_size` calls.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,
    /// Number of recent calls tracked in the sliding window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Failures within the window that open the breaker.
    #[serde(default = "default_window_failures")]
    pub window_failures: usize,
    /// Time (ms) an open breaker waits before admitting a probe.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: default_consecutive_failures(),
            window_size: default_window_size(),
            window_failures: default_window_failures(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

// ── Cache ────────────────────────────────────────────────────────────────

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CacheConfig {
    /// Whether completed responses are cached.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds a cached response stays valid.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum number of cached responses before LRU eviction.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ttl_secs: default_cache_ttl_secs(),
            capacity: default_cache_capacity(),
        }
    }
}

// ── Budget ───────────────────────────────────────────────────────────────

/// Budget refill policy for one service tier.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TierBudget {
    /// Amount (USD) credited at the start of each billing period.
    pub period_allowance: f64,
}

/// Per-tier budget refill policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BudgetConfig {
    /// Allowance for standard tenants.
    #[serde(default = "default_standard_budget")]
    pub standard: TierBudget,
    /// Allowance for premium tenants.
    #[serde(default = "default_premium_budget")]
    pub premium: TierBudget,
}

fn default_standard_budget() -> TierBudget {
    TierBudget {
        period_allowance: default_standard_allowance(),
    }
}

fn default_premium_budget() -> TierBudget {
    TierBudget {
        period_allowance: default_premium_allowance(),
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            standard: default_standard_budget(),
            premium: default_premium_budget(),
        }
    }
}

impl BudgetConfig {
    /// Period allowance for a tier.
    pub fn allowance_for(&self, tier: crate::ServiceTier) -> f64 {
        match tier {
            crate::ServiceTier::Standard => self.standard.period_allowance,
            crate::ServiceTier::Premium => self.premium.period_allowance,
        }
    }
}

// ── Backends ─────────────────────────────────────────────────────────────

/// Static description of one backend.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BackendProfile {
    /// Model identifier served by this backend (reported in the catalog).
    pub model: String,
    /// Cost per 1 000 tokens (prompt + completion) in USD. Zero for local tiers.
    pub cost_per_1k_tokens: f64,
    /// Number of concurrent calls the backend can absorb at full utilisation.
    pub capacity: u32,
}

/// Profiles for the three backends.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BackendsConfig {
    /// Fast local tier.
    #[serde(default = "default_local_tier_a")]
    pub local_tier_a: BackendProfile,
    /// Secondary local tier.
    #[serde(default = "default_local_tier_b")]
    pub local_tier_b: BackendProfile,
    /// External fallback.
    #[serde(default = "default_cloud_fallback")]
    pub cloud_fallback: BackendProfile,
}

fn default_local_tier_a() -> BackendProfile {
    BackendProfile {
        model: "phi4-mini".to_string(),
        cost_per_1k_tokens: 0.0,
        capacity: 8,
    }
}

fn default_local_tier_b() -> BackendProfile {
    BackendProfile {
        model: "mistral-7b".to_string(),
        cost_per_1k_tokens: 0.0,
        capacity: 4,
    }
}

fn default_cloud_fallback() -> BackendProfile {
    BackendProfile {
        model: "llama-3.3-70b-versatile".to_string(),
        cost_per_1k_tokens: 0.0008,
        capacity: 64,
    }
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            local_tier_a: default_local_tier_a(),
            local_tier_b: default_local_tier_b(),
            cloud_fallback: default_cloud_fallback(),
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DispatchConfig {
    /// Per-call backend timeout (ms). Expiry counts as a backend failure.
    #[serde(default = "default_invoke_timeout_ms")]
    pub invoke_timeout_ms: u64,
    /// Capacity of the channel-backed audit sink.
    #[serde(default = "default_audit_capacity")]
    pub audit_channel_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            invoke_timeout_ms: default_invoke_timeout_ms(),
            audit_channel_capacity: default_audit_capacity(),
        }
    }
}

// ── Shared handle ────────────────────────────────────────────────────────

/// Hot-swappable handle to the current [`EngineConfig`].
///
/// Cloning is cheap; every clone observes the same snapshot. Readers take
/// an `Arc` to the snapshot and release the lock immediately, so a reload
/// never blocks behind an in-flight request.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<EngineConfig>>>,
}

impl SharedConfig {
    /// Wrap an initial configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current snapshot.
    pub fn current(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.inner.read())
    }

    /// Replace the snapshot. Callers are expected to pass a validated config.
    pub fn replace(&self, config: EngineConfig) {
        *self.inner.write() = Arc::new(config);
        tracing::info!("engine config replaced");
    }

    /// Apply every config received on `rx` until the sender is dropped.
    ///
    /// Pair with [`watcher::ConfigWatcher`] for file-driven hot reload.
    pub fn follow(&self, mut rx: broadcast::Receiver<EngineConfig>) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(config) => handle.replace(config),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "config updates lagged; applying the newest");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Export the JSON Schema for `EngineConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(EngineConfig);
    serde_json::to_string_pretty(&schema)
}
