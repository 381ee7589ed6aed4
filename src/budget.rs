//! # Stage: Budget Ledger
//!
//! ## Responsibility
//! Hold each tenant's remaining budget for the current billing period and
//! apply debits and credits atomically.
//!
//! ## Guarantees
//! - Amounts are integer micro-units (1 unit = 1 000 000 micro), so repeated
//!   debits never drift
//! - `try_debit` is check-and-deduct under the tenant's shard lock: it either
//!   deducts the full amount or leaves the account untouched, and remaining
//!   can never go below zero
//! - Billing periods are calendar months (UTC, `YYYY-MM`); an account rolls
//!   over lazily the first time it is touched in a new period
//! - Accounts opened lazily take their allowance from the live config, so a
//!   reloaded allowance applies from the next period
//!
//! ## NOT Responsible For
//! - Pricing (that belongs to `routing::cost`)
//! - Deciding whether a request may use the cloud (that belongs to `routing`)

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::SharedConfig;
use crate::{ServiceTier, TenantId};

/// Micro-units per currency unit.
pub const MICROS_PER_UNIT: u64 = 1_000_000;

/// Convert an amount to micro-units, rounding to the nearest micro.
///
/// Negative and non-finite amounts map to zero.
pub fn to_micro(amount: f64) -> u64 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0;
    }
    (amount * MICROS_PER_UNIT as f64).round() as u64
}

/// Convert micro-units back to currency units.
pub fn from_micro(micro: u64) -> f64 {
    micro as f64 / MICROS_PER_UNIT as f64
}

/// Budget situation attached to decisions and audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    /// Budget remained after the request.
    WithinBudget,
    /// The tenant had no budget left, so paid backends were not eligible.
    BudgetExhausted,
    /// A completed request could not be fully charged.
    OverBudget,
}

impl BudgetStatus {
    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WithinBudget => "within_budget",
            Self::BudgetExhausted => "budget_exhausted",
            Self::OverBudget => "over_budget",
        }
    }
}

/// Snapshot of one tenant's account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetAccount {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Service tier the account was opened with.
    pub tier: ServiceTier,
    /// Billing period key (`YYYY-MM`).
    pub period: String,
    /// Amount credited at the start of the period, in micro-units.
    pub allowance_micro: u64,
    /// Amount left, in micro-units.
    pub remaining_micro: u64,
    /// Amount debited this period, in micro-units.
    pub spent_micro: u64,
}

impl BudgetAccount {
    /// Remaining budget in currency units.
    pub fn remaining(&self) -> f64 {
        from_micro(self.remaining_micro)
    }
}

#[derive(Debug)]
struct AccountState {
    tier: ServiceTier,
    period: String,
    allowance_micro: u64,
    remaining_micro: u64,
    spent_micro: u64,
    /// Opened with an explicit allowance that survives rollover.
    pinned: bool,
}

type PeriodClock = Arc<dyn Fn() -> String + Send + Sync>;

fn calendar_month() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

/// Per-tenant budget accounts.
pub struct BudgetLedger {
    accounts: DashMap<TenantId, AccountState>,
    config: SharedConfig,
    period: PeriodClock,
}

impl std::fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("accounts", &self.accounts.len())
            .finish()
    }
}

impl BudgetLedger {
    /// Create a ledger whose default allowances come from `config`.
    pub fn new(config: SharedConfig) -> Self {
        Self {
            accounts: DashMap::new(),
            config,
            period: Arc::new(calendar_month),
        }
    }

    /// Replace the billing-period clock. Mainly for tests.
    pub fn with_period_clock(mut self, clock: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.period = Arc::new(clock);
        self
    }

    fn tier_allowance(&self, tier: ServiceTier) -> u64 {
        to_micro(self.config.current().budget.allowance_for(tier))
    }

    fn roll(&self, state: &mut AccountState, period: &str, tenant: &TenantId) {
        if state.period == period {
            return;
        }
        if !state.pinned {
            state.allowance_micro = self.tier_allowance(state.tier);
        }
        tracing::info!(
            tenant = %tenant,
            from = %state.period,
            to = %period,
            allowance_micro = state.allowance_micro,
            "budget period rolled over"
        );
        state.period = period.to_string();
        state.remaining_micro = state.allowance_micro;
        state.spent_micro = 0;
    }

    /// Open the tenant's account from the tier allowance if it does not exist.
    ///
    /// An existing account keeps its balance; its tier is updated so the next
    /// rollover uses the new tier's allowance.
    pub fn ensure_account(&self, tenant: &TenantId, tier: ServiceTier) {
        let period = (self.period)();
        match self.accounts.entry(tenant.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                let state = e.get_mut();
                if state.tier != tier {
                    tracing::debug!(tenant = %tenant, tier = tier.as_str(), "tenant tier changed");
                    state.tier = tier;
                }
                self.roll(state, &period, tenant);
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let allowance_micro = self.tier_allowance(tier);
                tracing::debug!(tenant = %tenant, tier = tier.as_str(), allowance_micro, "budget account opened");
                e.insert(AccountState {
                    tier,
                    period,
                    allowance_micro,
                    remaining_micro: allowance_micro,
                    spent_micro: 0,
                    pinned: false,
                });
            }
        }
    }

    /// Open (or reset) an account with an explicit per-period allowance.
    pub fn open_account(&self, tenant: TenantId, tier: ServiceTier, allowance: f64) {
        let allowance_micro = to_micro(allowance);
        self.accounts.insert(
            tenant,
            AccountState {
                tier,
                period: (self.period)(),
                allowance_micro,
                remaining_micro: allowance_micro,
                spent_micro: 0,
                pinned: true,
            },
        );
    }

    /// Remaining budget in micro-units; zero for unknown tenants.
    pub fn remaining_micro(&self, tenant: &TenantId) -> u64 {
        let period = (self.period)();
        match self.accounts.get_mut(tenant) {
            Some(mut state) => {
                self.roll(&mut state, &period, tenant);
                state.remaining_micro
            }
            None => 0,
        }
    }

    /// Remaining budget in currency units; zero for unknown tenants.
    pub fn remaining(&self, tenant: &TenantId) -> f64 {
        from_micro(self.remaining_micro(tenant))
    }

    /// Deduct `micro` if the full amount is available.
    ///
    /// Returns `false` without touching the account when it is not. A zero
    /// debit always succeeds for a known tenant.
    pub fn try_debit_micro(&self, tenant: &TenantId, micro: u64) -> bool {
        let period = (self.period)();
        let Some(mut state) = self.accounts.get_mut(tenant) else {
            return false;
        };
        self.roll(&mut state, &period, tenant);
        if state.remaining_micro < micro {
            return false;
        }
        state.remaining_micro -= micro;
        state.spent_micro = state.spent_micro.saturating_add(micro);
        true
    }

    /// Deduct `amount` (currency units) if available.
    pub fn try_debit(&self, tenant: &TenantId, amount: f64) -> bool {
        self.try_debit_micro(tenant, to_micro(amount))
    }

    /// Return `amount` to the tenant's remaining budget.
    ///
    /// Unknown tenants are ignored.
    pub fn credit(&self, tenant: &TenantId, amount: f64) {
        let micro = to_micro(amount);
        let period = (self.period)();
        if let Some(mut state) = self.accounts.get_mut(tenant) {
            self.roll(&mut state, &period, tenant);
            state.remaining_micro = state.remaining_micro.saturating_add(micro);
            state.spent_micro = state.spent_micro.saturating_sub(micro);
        }
    }

    /// Snapshot of a tenant's account.
    pub fn account(&self, tenant: &TenantId) -> Option<BudgetAccount> {
        let period = (self.period)();
        let mut state = self.accounts.get_mut(tenant)?;
        self.roll(&mut state, &period, tenant);
        Some(BudgetAccount {
            tenant: tenant.clone(),
            tier: state.tier,
            period: state.period.clone(),
            allowance_micro: state.allowance_micro,
            remaining_micro: state.remaining_micro,
            spent_micro: state.spent_micro,
        })
    }

    /// Number of open accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether no account has been opened.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
