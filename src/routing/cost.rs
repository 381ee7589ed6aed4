//! Cost settlement and per-tenant usage accounting.
//!
//! Converts token usage into cost at the serving backend's rate, debits the
//! tenant's budget, and accumulates a usage report including what the same
//! traffic would have cost if every request had gone to the cloud fallback.
//!
//! Costs are computed in micro-units (1 unit = 1 000 000 micro) to avoid
//! floating-point drift in long-running aggregations.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::backend::{Backend, DataLocation};
use crate::budget::{from_micro, to_micro, BudgetLedger, BudgetStatus};
use crate::config::{BackendsConfig, SharedConfig};
use crate::metrics;
use crate::TenantId;

/// Outcome of charging one request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Settlement {
    /// Backend whose rate was applied.
    pub backend: Backend,
    /// Cost in currency units.
    pub cost: f64,
    /// Cost in micro-units.
    pub cost_micro: u64,
    /// `OverBudget` when the debit could not be applied.
    pub status: BudgetStatus,
}

/// Per-tenant usage report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TenantUsage {
    /// Tenant the report covers.
    pub tenant: String,
    /// Settled requests, cache hits included.
    pub requests: u64,
    /// Requests answered from the response cache.
    pub cache_hits: u64,
    /// Prompt tokens across computed requests.
    pub tokens_in: u64,
    /// Completion tokens across computed requests.
    pub tokens_out: u64,
    /// Cost actually debited.
    pub cost: f64,
    /// Cost the same traffic would have incurred on the cloud fallback.
    pub baseline_cost: f64,
    /// `baseline_cost - cost`, never negative.
    pub savings: f64,
    /// Requests whose debit failed after completion.
    pub over_budget: u64,
    /// Requests processed on local hardware.
    pub on_premise_requests: u64,
    /// Requests processed by an external provider.
    pub cloud_requests: u64,
}

#[derive(Debug, Default)]
struct UsageCounters {
    requests: u64,
    cache_hits: u64,
    tokens_in: u64,
    tokens_out: u64,
    cost_micro: u64,
    baseline_micro: u64,
    over_budget: u64,
    on_premise: u64,
    cloud: u64,
}

/// `tokens / 1000 × rate`, in micro-units, rounded to the nearest micro.
pub fn cost_micro_for(backend: Backend, backends: &BackendsConfig, tokens: u64) -> u64 {
    let rate_micro = u128::from(to_micro(backend.profile(backends).cost_per_1k_tokens));
    let micro = (u128::from(tokens) * rate_micro + 500) / 1000;
    u64::try_from(micro).unwrap_or(u64::MAX)
}

/// Charges tenants for completed requests.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct CostAccountant {
    config: SharedConfig,
    ledger: Arc<BudgetLedger>,
    usage: DashMap<TenantId, UsageCounters>,
}

impl std::fmt::Debug for CostAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostAccountant")
            .field("tenants", &self.usage.len())
            .finish()
    }
}

impl CostAccountant {
    /// Create an accountant debiting `ledger` at the rates in `config`.
    pub fn new(config: SharedConfig, ledger: Arc<BudgetLedger>) -> Self {
        Self {
            config,
            ledger,
            usage: DashMap::new(),
        }
    }

    /// Charge `tenant` for a request served by `backend`.
    ///
    /// A failed debit is not applied partially: the account is left
    /// untouched and the settlement is flagged `OverBudget`. The request
    /// itself still succeeds.
    pub fn settle(
        &self,
        tenant: &TenantId,
        backend: Backend,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Settlement {
        let config = self.config.current();
        let tokens = tokens_in.saturating_add(tokens_out);
        let cost_micro = cost_micro_for(backend, &config.backends, tokens);
        let baseline_micro = cost_micro_for(Backend::CloudFallback, &config.backends, tokens);

        let debited = self.ledger.try_debit_micro(tenant, cost_micro);
        let status = if debited {
            BudgetStatus::WithinBudget
        } else {
            tracing::warn!(
                tenant = %tenant,
                backend = %backend,
                cost_micro,
                "post-hoc debit failed, request flagged over budget"
            );
            BudgetStatus::OverBudget
        };

        {
            let mut u = self.usage.entry(tenant.clone()).or_default();
            u.requests += 1;
            u.tokens_in = u.tokens_in.saturating_add(tokens_in);
            u.tokens_out = u.tokens_out.saturating_add(tokens_out);
            u.baseline_micro = u.baseline_micro.saturating_add(baseline_micro);
            if debited {
                u.cost_micro = u.cost_micro.saturating_add(cost_micro);
            } else {
                u.over_budget += 1;
            }
            match backend.data_location() {
                DataLocation::OnPremise => u.on_premise += 1,
                DataLocation::Cloud => u.cloud += 1,
            }
        }

        if debited && cost_micro > 0 {
            metrics::add_cost_micro(backend.name(), cost_micro);
        }

        Settlement {
            backend,
            cost: from_micro(cost_micro),
            cost_micro,
            status,
        }
    }

    /// Record a cache hit: zero marginal cost, counted against the tenant.
    ///
    /// The baseline still accrues the cloud cost of the cached tokens, so
    /// cache hits show up as savings.
    pub fn settle_cache_hit(
        &self,
        tenant: &TenantId,
        backend: Backend,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Settlement {
        let config = self.config.current();
        let tokens = tokens_in.saturating_add(tokens_out);
        let baseline_micro = cost_micro_for(Backend::CloudFallback, &config.backends, tokens);
        {
            let mut u = self.usage.entry(tenant.clone()).or_default();
            u.requests += 1;
            u.cache_hits += 1;
            u.baseline_micro = u.baseline_micro.saturating_add(baseline_micro);
            u.on_premise += 1;
        }
        Settlement {
            backend,
            cost: 0.0,
            cost_micro: 0,
            status: BudgetStatus::WithinBudget,
        }
    }

    /// Usage report for one tenant; all zeros if it has no traffic.
    pub fn usage(&self, tenant: &TenantId) -> TenantUsage {
        match self.usage.get(tenant) {
            Some(u) => report(tenant, &u),
            None => TenantUsage {
                tenant: tenant.to_string(),
                ..TenantUsage::default()
            },
        }
    }

    /// Usage reports for every tenant seen, sorted by tenant id.
    pub fn snapshot(&self) -> Vec<TenantUsage> {
        let mut all: Vec<TenantUsage> = self
            .usage
            .iter()
            .map(|e| report(e.key(), e.value()))
            .collect();
        all.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        all
    }
}

fn report(tenant: &TenantId, u: &UsageCounters) -> TenantUsage {
    TenantUsage {
        tenant: tenant.to_string(),
        requests: u.requests,
        cache_hits: u.cache_hits,
        tokens_in: u.tokens_in,
        tokens_out: u.tokens_out,
        cost: from_micro(u.cost_micro),
        baseline_cost: from_micro(u.baseline_micro),
        savings: from_micro(u.baseline_micro.saturating_sub(u.cost_micro)),
        over_budget: u.over_budget,
        on_premise_requests: u.on_premise,
        cloud_requests: u.cloud,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceTier;

    fn setup(allowance: f64) -> (CostAccountant, Arc<BudgetLedger>, TenantId) {
        let config = SharedConfig::default();
        let ledger = Arc::new(BudgetLedger::new(config.clone()));
        let tenant = TenantId::new("acme");
        ledger.open_account(tenant.clone(), ServiceTier::Premium, allowance);
        (CostAccountant::new(config, Arc::clone(&ledger)), ledger, tenant)
    }

    #[test]
    fn test_cost_uses_backend_rate() {
        let backends = BackendsConfig::default();
        // 0.0008 per 1K tokens = 800 micro per 1K.
        assert_eq!(cost_micro_for(Backend::CloudFallback, &backends, 1000), 800);
        assert_eq!(cost_micro_for(Backend::CloudFallback, &backends, 2500), 2000);
        assert_eq!(cost_micro_for(Backend::LocalTierA, &backends, 1_000_000), 0);
    }

    #[test]
    fn test_settle_cloud_debits_ledger() {
        let (acct, ledger, tenant) = setup(1.0);
        let s = acct.settle(&tenant, Backend::CloudFallback, 600, 400);
        assert_eq!(s.cost_micro, 800);
        assert_eq!(s.status, BudgetStatus::WithinBudget);
        assert_eq!(ledger.remaining_micro(&tenant), 1_000_000 - 800);
    }

    #[test]
    fn test_settle_local_is_free() {
        let (acct, ledger, tenant) = setup(1.0);
        let s = acct.settle(&tenant, Backend::LocalTierA, 5000, 5000);
        assert_eq!(s.cost_micro, 0);
        assert_eq!(ledger.remaining_micro(&tenant), 1_000_000);
    }

    #[test]
    fn test_failed_debit_flags_over_budget_and_leaves_account() {
        let (acct, ledger, tenant) = setup(0.0005);
        let s = acct.settle(&tenant, Backend::CloudFallback, 1000, 0);
        assert_eq!(s.status, BudgetStatus::OverBudget);
        assert_eq!(ledger.remaining_micro(&tenant), 500);
        let usage = acct.usage(&tenant);
        assert_eq!(usage.over_budget, 1);
        assert_eq!(usage.cost, 0.0);
    }

    #[test]
    fn test_usage_reports_savings_vs_cloud() {
        let (acct, _ledger, tenant) = setup(10.0);
        acct.settle(&tenant, Backend::LocalTierA, 1000, 1000);
        acct.settle(&tenant, Backend::CloudFallback, 500, 500);
        acct.settle_cache_hit(&tenant, Backend::LocalTierB, 1000, 0);

        let u = acct.usage(&tenant);
        assert_eq!(u.requests, 3);
        assert_eq!(u.cache_hits, 1);
        assert_eq!(u.on_premise_requests, 2);
        assert_eq!(u.cloud_requests, 1);
        assert!((u.cost - 0.0008).abs() < 1e-12);
        assert!((u.baseline_cost - 0.0032).abs() < 1e-12);
        assert!((u.savings - 0.0024).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_tenant_usage_is_empty() {
        let (acct, _ledger, _tenant) = setup(1.0);
        let u = acct.usage(&TenantId::new("nobody"));
        assert_eq!(u.tenant, "nobody");
        assert_eq!(u.requests, 0);
    }

    #[test]
    fn test_snapshot_sorted_by_tenant() {
        let (acct, ledger, _) = setup(1.0);
        for name in ["zeta", "alpha"] {
            let t = TenantId::new(name);
            ledger.open_account(t.clone(), ServiceTier::Standard, 1.0);
            acct.settle(&t, Backend::LocalTierA, 1, 1);
        }
        let names: Vec<_> = acct.snapshot().into_iter().map(|u| u.tenant).collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }
}
