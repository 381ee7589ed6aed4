//! # Stage: Dispatch
//!
//! ## Responsibility
//! Orchestrate one request end to end: score it, consult the response
//! cache, route on a miss, walk the fallback cascade under the per-backend
//! circuit breakers with a per-call timeout, settle cost against the
//! tenant's budget, publish the result to the cache, and emit exactly one
//! audit event.
//!
//! ## Guarantees
//! - Bounded: at most one invocation per backend in the cascade.
//! - Single-flight: concurrent identical requests share one backend call.
//! - No cache pollution: failed requests are never cached.
//! - Non-blocking: no lock is held across a backend invocation, and audit
//!   recording never fails a completed request.
//! - Cancel-safe: dropping the returned future releases in-flight load
//!   guards, breaker probes and the cache's in-flight marker.
//!
//! ## NOT Responsible For
//! - Prompt sanitisation (done upstream of the dispatcher)
//! - Transport or authentication

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::audit::{AuditEvent, AuditOutcome, AuditRecorder};
use crate::backend::{Backend, BackendOutput, BackendRegistry, InvokeParams};
use crate::budget::{BudgetLedger, BudgetStatus};
use crate::catalog::{models_for_tier, HealthReport, ModelInfo};
use crate::config::SharedConfig;
use crate::load::LoadMonitor;
use crate::metrics;
use crate::resilience::{BreakerSet, CacheKey, CachedResponse, ResponseCache};
use crate::routing::{
    ComplexityScorer, CostAccountant, RoutingDecisionEngine, RoutingInputs, TenantUsage,
};
use crate::{InferenceRequest, InferenceResponse, RouterError, ServiceTier, TenantId};

/// What happened at one cascade step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The backend returned a result.
    Success,
    /// The backend returned an error.
    Failed,
    /// The call exceeded the per-call timeout.
    TimedOut,
    /// The breaker rejected the call; the backend was not invoked.
    BreakerOpen,
    /// The tenant had no budget for a paid backend; not invoked.
    NotAdmitted,
    /// No collaborator is registered for the backend; not invoked.
    Unavailable,
}

impl AttemptOutcome {
    /// Stable label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failure",
            Self::TimedOut => "timeout",
            Self::BreakerOpen => "breaker_open",
            Self::NotAdmitted => "not_admitted",
            Self::Unavailable => "unavailable",
        }
    }

    /// Whether the backend was actually called.
    pub fn invoked(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::TimedOut)
    }
}

/// One cascade step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    /// Backend considered.
    pub backend: Backend,
    /// Step outcome.
    pub outcome: AttemptOutcome,
    /// Time spent on the step.
    pub latency_ms: u64,
    /// Failure detail, if any.
    pub error: Option<String>,
}

/// Request-level failures returned by [`RequestDispatcher::dispatch`].
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Nothing was invoked because the tenant's budget blocked every
    /// remaining candidate.
    #[error("admission rejected for tenant {tenant}: budget exhausted")]
    AdmissionRejected {
        /// Tenant whose budget blocked the request.
        tenant: String,
        /// Every cascade step considered.
        attempts: Vec<AttemptRecord>,
    },

    /// Every backend in the cascade failed or was skipped.
    #[error("all backends failed after {} cascade steps", .attempts.len())]
    CascadeExhausted {
        /// Every cascade step considered.
        attempts: Vec<AttemptRecord>,
    },
}

impl DispatchError {
    /// Cascade steps that led to the failure.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::AdmissionRejected { attempts, .. } | Self::CascadeExhausted { attempts } => {
                attempts
            }
        }
    }

    fn audit_outcome(&self) -> AuditOutcome {
        match self {
            Self::AdmissionRejected { .. } => AuditOutcome::AdmissionRejected,
            Self::CascadeExhausted { .. } => AuditOutcome::CascadeExhausted,
        }
    }
}

/// Details of the computing caller's cascade walk, kept for its audit event.
#[derive(Debug)]
struct MissReport {
    attempts: u32,
    rule: &'static str,
    budget_status: BudgetStatus,
}

type StepFailure = (AttemptOutcome, Option<String>);

/// Top-level request orchestrator.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct RequestDispatcher {
    config: SharedConfig,
    registry: BackendRegistry,
    load: LoadMonitor,
    breakers: BreakerSet,
    ledger: Arc<BudgetLedger>,
    cache: ResponseCache,
    scorer: ComplexityScorer,
    engine: RoutingDecisionEngine,
    accountant: CostAccountant,
    audit: Arc<dyn AuditRecorder>,
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("registry", &self.registry)
            .field("ledger", &self.ledger)
            .field("cache", &self.cache)
            .finish()
    }
}

impl RequestDispatcher {
    /// Wire a dispatcher over `registry`, reading `config` per operation.
    pub fn new(
        config: SharedConfig,
        registry: BackendRegistry,
        audit: Arc<dyn AuditRecorder>,
    ) -> Self {
        let ledger = Arc::new(BudgetLedger::new(config.clone()));
        Self {
            registry,
            load: LoadMonitor::new(config.clone()),
            breakers: BreakerSet::new(config.clone()),
            cache: ResponseCache::new(config.clone()),
            scorer: ComplexityScorer::new(),
            engine: RoutingDecisionEngine::new(config.clone()),
            accountant: CostAccountant::new(config.clone(), Arc::clone(&ledger)),
            ledger,
            audit,
            config,
        }
    }

    /// Replace the budget ledger (e.g. one with a custom period clock).
    pub fn with_ledger(mut self, ledger: BudgetLedger) -> Self {
        let ledger = Arc::new(ledger);
        self.accountant = CostAccountant::new(self.config.clone(), Arc::clone(&ledger));
        self.ledger = ledger;
        self
    }

    /// Serve one request.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::AdmissionRejected`] if no backend was invoked and
    ///   the tenant's budget blocked a candidate.
    /// - [`DispatchError::CascadeExhausted`] if every candidate failed or
    ///   was skipped.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn dispatch(
        &self,
        request: InferenceRequest,
    ) -> Result<InferenceResponse, DispatchError> {
        let span = tracing::info_span!(
            "dispatch",
            request_id = %request.request_id,
            tenant = %request.tenant,
            tier = request.tier.as_str(),
        );
        self.dispatch_inner(request).instrument(span).await
    }

    async fn dispatch_inner(
        &self,
        request: InferenceRequest,
    ) -> Result<InferenceResponse, DispatchError> {
        let started = Instant::now();
        self.ledger.ensure_account(&request.tenant, request.tier);
        let complexity = self.scorer.score(&request);
        let key = CacheKey::for_request(&request);

        let mut report: Option<MissReport> = None;
        let slot = &mut report;
        let req = &request;
        let looked = self
            .cache
            .lookup_or_compute(&key, || async move {
                let (result, miss) = self.execute_miss(req, complexity).await;
                *slot = Some(miss);
                result
            })
            .await;

        let latency_ms = elapsed_ms(started);
        match looked {
            Ok((value, origin)) => {
                let (cost, budget_status, attempts, rule) = if origin.is_cached() {
                    let settlement = self.accountant.settle_cache_hit(
                        &request.tenant,
                        value.backend,
                        value.tokens_in,
                        value.tokens_out,
                    );
                    metrics::inc_request(value.backend.name(), "cache_hit");
                    let status = if self.ledger.remaining_micro(&request.tenant) > 0 {
                        settlement.status
                    } else {
                        BudgetStatus::BudgetExhausted
                    };
                    (0.0, status, 0, None)
                } else {
                    let (attempts, rule, status) = report
                        .as_ref()
                        .map(|r| (r.attempts, Some(r.rule), r.budget_status))
                        .unwrap_or((1, None, BudgetStatus::WithinBudget));
                    (value.cost, status, attempts, rule)
                };

                self.record_audit(AuditEvent {
                    timestamp: chrono::Utc::now(),
                    request_id: request.request_id.clone(),
                    tenant: request.tenant.to_string(),
                    request_hash: key.as_str().to_string(),
                    backend: Some(value.backend),
                    latency_ms,
                    cost,
                    outcome: AuditOutcome::Success,
                    budget_status,
                    data_classification: Some(value.backend.data_location()),
                    cache_hit: origin.is_cached(),
                    attempts,
                    rule,
                });

                info!(
                    backend = %value.backend,
                    latency_ms,
                    cost,
                    cache = ?origin,
                    "request served"
                );

                Ok(InferenceResponse {
                    request_id: request.request_id,
                    text: value.text,
                    model_used: value.backend,
                    latency_ms,
                    cost,
                    data_location: value.backend.data_location(),
                    tokens_in: value.tokens_in,
                    tokens_out: value.tokens_out,
                    timestamp: chrono::Utc::now(),
                    cache_hit: origin.is_cached(),
                })
            }
            Err(err) => {
                let (rule, budget_status) = report
                    .as_ref()
                    .map(|r| (Some(r.rule), r.budget_status))
                    .unwrap_or((None, BudgetStatus::WithinBudget));
                self.record_audit(AuditEvent {
                    timestamp: chrono::Utc::now(),
                    request_id: request.request_id.clone(),
                    tenant: request.tenant.to_string(),
                    request_hash: key.as_str().to_string(),
                    backend: None,
                    latency_ms,
                    cost: 0.0,
                    outcome: err.audit_outcome(),
                    budget_status,
                    data_classification: None,
                    cache_hit: false,
                    attempts: count_u32(err.attempts().len()),
                    rule,
                });
                warn!(error = %err, latency_ms, "request failed");
                Err(err)
            }
        }
    }

    /// Route and walk the cascade. Runs only in the caller that owns the
    /// cache's in-flight marker.
    async fn execute_miss(
        &self,
        request: &InferenceRequest,
        complexity: f64,
    ) -> (Result<CachedResponse, DispatchError>, MissReport) {
        let config = self.config.current();
        let inputs = RoutingInputs {
            complexity,
            tier: request.tier,
            budget_remaining: self.ledger.remaining(&request.tenant),
            load: self.load.snapshot(),
            health: self.breakers.health(),
        };
        let decision = self.engine.decide(request, &inputs);
        let timeout = Duration::from_millis(config.dispatch.invoke_timeout_ms.max(1));
        let params = InvokeParams {
            max_tokens: request.max_tokens,
            temperature: request.params.temperature,
            top_p: request.params.top_p,
        };

        let mut attempts = Vec::with_capacity(decision.cascade.len());
        for &backend in &decision.cascade {
            let step_started = Instant::now();
            match self.attempt(backend, request, &params, timeout).await {
                Ok(output) => {
                    attempts.push(AttemptRecord {
                        backend,
                        outcome: AttemptOutcome::Success,
                        latency_ms: elapsed_ms(step_started),
                        error: None,
                    });
                    let settlement = self.accountant.settle(
                        &request.tenant,
                        backend,
                        output.tokens_in,
                        output.tokens_out,
                    );
                    let budget_status = match settlement.status {
                        BudgetStatus::OverBudget => BudgetStatus::OverBudget,
                        _ => decision.budget_status,
                    };
                    let value = CachedResponse {
                        text: output.text,
                        backend,
                        cost: settlement.cost,
                        tokens_in: output.tokens_in,
                        tokens_out: output.tokens_out,
                        created_at: chrono::Utc::now(),
                    };
                    let report = MissReport {
                        attempts: count_u32(attempts.len()),
                        rule: decision.rule,
                        budget_status,
                    };
                    return (Ok(value), report);
                }
                Err((outcome, error)) => {
                    debug!(
                        backend = %backend,
                        outcome = outcome.as_str(),
                        error = error.as_deref().unwrap_or(""),
                        "cascade step did not produce a result"
                    );
                    attempts.push(AttemptRecord {
                        backend,
                        outcome,
                        latency_ms: elapsed_ms(step_started),
                        error,
                    });
                }
            }
        }

        let report = MissReport {
            attempts: count_u32(attempts.len()),
            rule: decision.rule,
            budget_status: decision.budget_status,
        };
        let nothing_invoked = attempts.iter().all(|a| !a.outcome.invoked());
        let budget_blocked = attempts
            .iter()
            .any(|a| a.outcome == AttemptOutcome::NotAdmitted);
        let err = if nothing_invoked && budget_blocked {
            DispatchError::AdmissionRejected {
                tenant: request.tenant.to_string(),
                attempts,
            }
        } else {
            DispatchError::CascadeExhausted { attempts }
        };
        (Err(err), report)
    }

    /// One cascade step: admission, breaker, load guard, timed invocation.
    async fn attempt(
        &self,
        backend: Backend,
        request: &InferenceRequest,
        params: &InvokeParams,
        timeout: Duration,
    ) -> Result<BackendOutput, StepFailure> {
        if !backend.is_local() && self.ledger.remaining_micro(&request.tenant) == 0 {
            metrics::inc_request(backend.name(), AttemptOutcome::NotAdmitted.as_str());
            return Err((AttemptOutcome::NotAdmitted, None));
        }
        let Some(invoker) = self.registry.get(backend) else {
            return Err((AttemptOutcome::Unavailable, None));
        };
        let Some(permit) = self.breakers.get(backend).acquire() else {
            metrics::inc_request(backend.name(), AttemptOutcome::BreakerOpen.as_str());
            return Err((AttemptOutcome::BreakerOpen, None));
        };

        let guard = self.load.begin(backend);
        let started = Instant::now();
        let result =
            tokio::time::timeout(timeout, invoker.invoke(&request.prompt, params, timeout)).await;
        metrics::record_backend_latency(backend.name(), started.elapsed());

        let (outcome, result) = match result {
            Ok(Ok(output)) => (AttemptOutcome::Success, Ok(output)),
            Ok(Err(e)) => (AttemptOutcome::Failed, Err(e)),
            Err(_) => (
                AttemptOutcome::TimedOut,
                Err(RouterError::Timeout {
                    backend: backend.name().to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            ),
        };
        let success = outcome == AttemptOutcome::Success;
        permit.record(success);
        guard.complete(success);
        metrics::inc_request(backend.name(), outcome.as_str());

        result.map_err(|e| {
            warn!(backend = %backend, error = %e, "backend call failed");
            (outcome, Some(e.to_string()))
        })
    }

    fn record_audit(&self, event: AuditEvent) {
        self.audit.record(event);
    }

    // ── Reports and accessors ───────────────────────────────────────────

    /// Breaker state and load of every backend.
    pub fn health(&self) -> HealthReport {
        HealthReport::collect(&self.breakers, &self.load, |b| {
            self.registry.get(b).is_some()
        })
    }

    /// Usage report for one tenant.
    pub fn usage(&self, tenant: &TenantId) -> TenantUsage {
        self.accountant.usage(tenant)
    }

    /// Usage reports for every tenant seen.
    pub fn usage_all(&self) -> Vec<TenantUsage> {
        self.accountant.snapshot()
    }

    /// Backends available to a tier under the current configuration.
    pub fn models(&self, tier: ServiceTier) -> Vec<ModelInfo> {
        models_for_tier(tier, &self.config.current().backends)
    }

    /// The shared configuration handle.
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// The budget ledger.
    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    /// The per-backend circuit breakers.
    pub fn breakers(&self) -> &BreakerSet {
        &self.breakers
    }

    /// The response cache.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// The load monitor.
    pub fn load(&self) -> &LoadMonitor {
        &self.load
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

// ── Tests ──────────────────────────────────────────────────────────────
