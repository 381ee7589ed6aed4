//! # Stage: Routing
//!
//! ## Responsibility
//! Decide which backend serves a request and what it costs the tenant.
//! Scoring estimates prompt complexity, the decision engine applies an
//! ordered rule list over complexity, tier, budget, load and breaker health,
//! and the cost accountant settles usage against the budget ledger.
//!
//! ## Guarantees
//! - Deterministic: identical inputs always produce the same score and the
//!   same decision.
//! - Pure: scoring and decisions perform no I/O and read no clocks.
//! - Late-bound: thresholds and cost rates are read from the shared config
//!   on every call, so hot reloads apply to the next request.
//!
//! ## NOT Responsible For
//! - Calling backends or walking the cascade (that belongs to `dispatcher`)
//! - Tracking breaker state or load (see `resilience` and `load`)

pub mod config;
pub mod cost;
pub mod engine;
pub mod scorer;

// Re-exports for convenience
pub use config::RoutingConfig;
pub use cost::{CostAccountant, Settlement, TenantUsage};
pub use engine::{RoutingDecision, RoutingDecisionEngine, RoutingInputs, RoutingRule, RULES};
pub use scorer::{ComplexityScorer, ScoreBreakdown};
