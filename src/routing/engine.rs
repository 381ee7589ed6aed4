//! Routing decision engine.
//!
//! The [`RoutingDecisionEngine`] turns a complexity score plus live signals
//! (tier, remaining budget, load, breaker health) into a [`RoutingDecision`]:
//! the chosen backend and the ordered cascade to fall back through.
//!
//! Rules are evaluated in order and the first match wins:
//!
//! | # | Rule | Backend |
//! |---|------|---------|
//! | 1 | `model_override` | explicit override, if its breaker admits calls |
//! | 2 | `low_complexity` | complexity below the low threshold and tier A unsaturated → tier A |
//! | 3 | `mid_complexity` | complexity below the mid threshold and tier B unsaturated → tier B |
//! | 4 | `premium_cloud` | premium tenant with budget left and cloud healthy → cloud |
//! | 5 | `default_local` | tier B regardless of load |
//!
//! `decide` performs no I/O and reads no clocks: identical inputs always
//! produce identical decisions.

use serde::Serialize;

use super::config::RoutingConfig;
use crate::backend::Backend;
use crate::budget::BudgetStatus;
use crate::config::{BackendsConfig, EngineConfig, SharedConfig};
use crate::load::LoadSnapshot;
use crate::resilience::HealthSnapshot;
use crate::{InferenceRequest, ServiceTier};

/// Live signals consulted by the rules.
#[derive(Debug, Clone, Copy)]
pub struct RoutingInputs {
    /// Complexity score in `[0, 1]`.
    pub complexity: f64,
    /// Tenant service tier.
    pub tier: ServiceTier,
    /// Tenant's remaining budget.
    pub budget_remaining: f64,
    /// Per-backend load.
    pub load: LoadSnapshot,
    /// Per-backend breaker availability.
    pub health: HealthSnapshot,
}

/// Everything a rule may look at.
pub struct RuleContext<'a> {
    /// The request being routed.
    pub request: &'a InferenceRequest,
    /// Live signals.
    pub inputs: &'a RoutingInputs,
    /// Thresholds.
    pub config: &'a RoutingConfig,
}

/// One entry in the ordered rule list.
pub struct RoutingRule {
    /// Stable identifier recorded in decisions.
    pub name: &'static str,
    /// Human-readable condition.
    pub description: &'static str,
    select: fn(&RuleContext<'_>) -> Option<Backend>,
}

impl RoutingRule {
    /// Evaluate the rule; `Some` when it matches.
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<Backend> {
        (self.select)(ctx)
    }
}

impl std::fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingRule")
            .field("name", &self.name)
            .finish()
    }
}

fn rule_override(ctx: &RuleContext<'_>) -> Option<Backend> {
    ctx.request
        .model_override
        .filter(|b| ctx.inputs.health.is_available(*b))
}

fn rule_low_complexity(ctx: &RuleContext<'_>) -> Option<Backend> {
    let load = ctx.inputs.load.get(Backend::LocalTierA);
    (ctx.inputs.complexity < ctx.config.low_complexity_threshold
        && load < ctx.config.tier_a_saturation)
        .then_some(Backend::LocalTierA)
}

fn rule_mid_complexity(ctx: &RuleContext<'_>) -> Option<Backend> {
    let load = ctx.inputs.load.get(Backend::LocalTierB);
    (ctx.inputs.complexity < ctx.config.mid_complexity_threshold
        && load < ctx.config.tier_b_saturation)
        .then_some(Backend::LocalTierB)
}

fn rule_premium_cloud(ctx: &RuleContext<'_>) -> Option<Backend> {
    (ctx.inputs.tier == ServiceTier::Premium
        && ctx.inputs.budget_remaining > 0.0
        && ctx.inputs.health.is_available(Backend::CloudFallback))
    .then_some(Backend::CloudFallback)
}

fn rule_default_local(_: &RuleContext<'_>) -> Option<Backend> {
    Some(Backend::LocalTierB)
}

/// The ordered rule list. The last rule always matches.
pub const RULES: [RoutingRule; 5] = [
    RoutingRule {
        name: "model_override",
        description: "explicit model override whose breaker admits calls",
        select: rule_override,
    },
    RoutingRule {
        name: "low_complexity",
        description: "complexity below low threshold and tier A below saturation",
        select: rule_low_complexity,
    },
    RoutingRule {
        name: "mid_complexity",
        description: "complexity below mid threshold and tier B below saturation",
        select: rule_mid_complexity,
    },
    RoutingRule {
        name: "premium_cloud",
        description: "premium tier with remaining budget and a healthy cloud breaker",
        select: rule_premium_cloud,
    },
    RoutingRule {
        name: "default_local",
        description: "secondary local tier regardless of load",
        select: rule_default_local,
    },
];

/// The chosen backend, its fallbacks, and the inputs that produced them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    /// First backend to try.
    pub chosen: Backend,
    /// Every backend to try, in order; `cascade[0] == chosen`.
    pub cascade: Vec<Backend>,
    /// Name of the rule that matched.
    pub rule: &'static str,
    /// Complexity score used.
    pub complexity: f64,
    /// Load snapshot used.
    pub load: LoadSnapshot,
    /// Remaining budget used.
    pub budget_remaining: f64,
    /// `BudgetExhausted` when the tenant had nothing left to spend.
    pub budget_status: BudgetStatus,
}

/// Ordered fallback list: `chosen`, the other local tiers by ascending cost
/// (priority order on ties), then the cloud fallback last.
pub fn build_cascade(chosen: Backend, backends: &BackendsConfig) -> Vec<Backend> {
    let mut locals: Vec<Backend> = Backend::ALL
        .into_iter()
        .filter(|b| b.is_local() && *b != chosen)
        .collect();
    locals.sort_by(|a, b| {
        a.profile(backends)
            .cost_per_1k_tokens
            .total_cmp(&b.profile(backends).cost_per_1k_tokens)
            .then(a.cmp(b))
    });

    let mut cascade = Vec::with_capacity(Backend::ALL.len());
    cascade.push(chosen);
    cascade.extend(locals);
    if chosen != Backend::CloudFallback {
        cascade.push(Backend::CloudFallback);
    }
    cascade
}

/// Evaluate the rules against an explicit config snapshot.
pub fn decide_with(
    config: &EngineConfig,
    request: &InferenceRequest,
    inputs: &RoutingInputs,
) -> RoutingDecision {
    let ctx = RuleContext {
        request,
        inputs,
        config: &config.routing,
    };
    let (rule, chosen) = RULES
        .iter()
        .find_map(|r| r.evaluate(&ctx).map(|b| (r.name, b)))
        .unwrap_or(("default_local", Backend::LocalTierB));

    let budget_status = if inputs.budget_remaining > 0.0 {
        BudgetStatus::WithinBudget
    } else {
        BudgetStatus::BudgetExhausted
    };

    RoutingDecision {
        chosen,
        cascade: build_cascade(chosen, &config.backends),
        rule,
        complexity: inputs.complexity,
        load: inputs.load,
        budget_remaining: inputs.budget_remaining,
        budget_status,
    }
}

/// Backend selection over the live configuration.
#[derive(Debug, Clone)]
pub struct RoutingDecisionEngine {
    config: SharedConfig,
}

impl RoutingDecisionEngine {
    /// Create an engine reading thresholds from `config` on every decision.
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }

    /// Choose a backend and cascade for `request`.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn decide(&self, request: &InferenceRequest, inputs: &RoutingInputs) -> RoutingDecision {
        let config = self.config.current();
        let decision = decide_with(&config, request, inputs);
        tracing::debug!(
            request_id = %request.request_id,
            rule = decision.rule,
            chosen = %decision.chosen,
            complexity = decision.complexity,
            budget_status = decision.budget_status.as_str(),
            "routing decision"
        );
        decision
    }

    /// The ordered rule list, for inspection.
    pub fn rules(&self) -> &'static [RoutingRule] {
        &RULES
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(complexity: f64, tier: ServiceTier, budget: f64, load: LoadSnapshot) -> RoutingInputs {
        RoutingInputs {
            complexity,
            tier,
            budget_remaining: budget,
            load,
            health: HealthSnapshot::all_available(),
        }
    }

    fn decide(req: &InferenceRequest, inputs: &RoutingInputs) -> RoutingDecision {
        decide_with(&EngineConfig::default(), req, inputs)
    }

    fn request() -> InferenceRequest {
        InferenceRequest::new("acme", "hello")
    }

    #[test]
    fn test_low_complexity_standard_routes_to_tier_a() {
        let d = decide(
            &request(),
            &inputs(0.1, ServiceTier::Standard, 10.0, LoadSnapshot::new(0.2, 0.0, 0.0)),
        );
        assert_eq!(d.chosen, Backend::LocalTierA);
        assert_eq!(d.rule, "low_complexity");
        assert_eq!(
            d.cascade,
            vec![Backend::LocalTierA, Backend::LocalTierB, Backend::CloudFallback]
        );
    }

    #[test]
    fn test_saturated_tier_a_falls_to_tier_b() {
        let d = decide(
            &request(),
            &inputs(0.5, ServiceTier::Standard, 10.0, LoadSnapshot::new(0.95, 0.3, 0.0)),
        );
        assert_eq!(d.chosen, Backend::LocalTierB);
        assert_eq!(d.rule, "mid_complexity");
        assert_eq!(
            d.cascade,
            vec![Backend::LocalTierB, Backend::LocalTierA, Backend::CloudFallback]
        );
    }

    #[test]
    fn test_complex_premium_routes_to_cloud() {
        let d = decide(
            &request(),
            &inputs(0.8, ServiceTier::Premium, 10.0, LoadSnapshot::default()),
        );
        assert_eq!(d.chosen, Backend::CloudFallback);
        assert_eq!(d.rule, "premium_cloud");
        assert_eq!(d.budget_status, BudgetStatus::WithinBudget);
        assert_eq!(
            d.cascade,
            vec![Backend::CloudFallback, Backend::LocalTierA, Backend::LocalTierB]
        );
    }

    #[test]
    fn test_complex_premium_without_budget_stays_local() {
        let d = decide(
            &request(),
            &inputs(0.8, ServiceTier::Premium, 0.0, LoadSnapshot::default()),
        );
        assert_eq!(d.chosen, Backend::LocalTierB);
        assert_eq!(d.rule, "default_local");
        assert_eq!(d.budget_status, BudgetStatus::BudgetExhausted);
    }

    #[test]
    fn test_complex_standard_stays_local() {
        let d = decide(
            &request(),
            &inputs(0.9, ServiceTier::Standard, 10.0, LoadSnapshot::default()),
        );
        assert_eq!(d.chosen, Backend::LocalTierB);
        assert_eq!(d.rule, "default_local");
    }

    #[test]
    fn test_open_cloud_breaker_skips_premium_rule() {
        let mut i = inputs(0.8, ServiceTier::Premium, 10.0, LoadSnapshot::default());
        i.health = HealthSnapshot::all_available().without(Backend::CloudFallback);
        assert_eq!(decide(&request(), &i).chosen, Backend::LocalTierB);
    }

    #[test]
    fn test_override_wins_when_healthy() {
        let req = request().with_model(Backend::CloudFallback);
        let d = decide(
            &req,
            &inputs(0.1, ServiceTier::Standard, 10.0, LoadSnapshot::default()),
        );
        assert_eq!(d.chosen, Backend::CloudFallback);
        assert_eq!(d.rule, "model_override");
    }

    #[test]
    fn test_override_ignored_when_breaker_open() {
        let req = request().with_model(Backend::LocalTierB);
        let mut i = inputs(0.1, ServiceTier::Standard, 10.0, LoadSnapshot::default());
        i.health = HealthSnapshot::all_available().without(Backend::LocalTierB);
        let d = decide(&req, &i);
        assert_eq!(d.chosen, Backend::LocalTierA);
        assert_eq!(d.rule, "low_complexity");
    }

    #[test]
    fn test_both_locals_saturated_defaults_to_tier_b() {
        let d = decide(
            &request(),
            &inputs(0.1, ServiceTier::Standard, 10.0, LoadSnapshot::new(1.0, 1.0, 0.0)),
        );
        assert_eq!(d.chosen, Backend::LocalTierB);
        assert_eq!(d.rule, "default_local");
    }

    #[test]
    fn test_cascade_orders_locals_by_cost() {
        let mut backends = BackendsConfig::default();
        backends.local_tier_a.cost_per_1k_tokens = 0.002;
        backends.local_tier_b.cost_per_1k_tokens = 0.001;
        assert_eq!(
            build_cascade(Backend::CloudFallback, &backends),
            vec![Backend::CloudFallback, Backend::LocalTierB, Backend::LocalTierA]
        );
    }

    #[test]
    fn test_cascade_never_repeats_a_backend() {
        let backends = BackendsConfig::default();
        for chosen in Backend::ALL {
            let cascade = build_cascade(chosen, &backends);
            assert_eq!(cascade.len(), 3);
            assert_eq!(cascade[0], chosen);
            let mut sorted = cascade.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), 3);
        }
    }

    #[test]
    fn test_decision_is_deterministic() {
        let req = request();
        let i = inputs(0.45, ServiceTier::Premium, 3.0, LoadSnapshot::new(0.5, 0.5, 0.1));
        assert_eq!(decide(&req, &i), decide(&req, &i));
    }

    #[test]
    fn test_engine_reads_live_thresholds() {
        let shared = SharedConfig::default();
        let engine = RoutingDecisionEngine::new(shared.clone());
        let i = inputs(0.35, ServiceTier::Standard, 1.0, LoadSnapshot::default());
        assert_eq!(engine.decide(&request(), &i).chosen, Backend::LocalTierB);

        let mut next = EngineConfig::default();
        next.routing.low_complexity_threshold = 0.4;
        shared.replace(next);
        assert_eq!(engine.decide(&request(), &i).chosen, Backend::LocalTierA);
    }

    #[test]
    fn test_rule_list_is_inspectable() {
        let names: Vec<_> = RULES.iter().map(|r| r.name).collect();
        assert_eq!(
            names,
            [
                "model_override",
                "low_complexity",
                "mid_complexity",
                "premium_cloud",
                "default_local"
            ]
        );
    }
}
