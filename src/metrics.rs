//! Prometheus metrics for the routing engine.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_request`, `inc_cache_event`, …) are no-ops until then, so the
//! engine is always safe to run and observability simply degrades.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `edgellm_requests_total` | Counter | `backend`, `outcome` |
//! | `edgellm_cache_events_total` | Counter | `event` |
//! | `edgellm_breaker_transitions_total` | Counter | `backend`, `to` |
//! | `edgellm_backend_latency_seconds` | Histogram | `backend` |
//! | `edgellm_cost_micro_total` | Counter | `backend` |
//! | `edgellm_audit_dropped_total` | Counter | none |

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    Opts, Registry, TextEncoder,
};

use crate::RouterError;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All engine metrics, stored together in a single [`OnceLock`].
pub struct Metrics {
    /// Registry that owns every descriptor below.
    pub registry: Registry,
    /// Backend attempts by outcome (`success`, `failure`, `timeout`, `breaker_open`, `cache_hit`).
    pub requests_total: CounterVec,
    /// Cache lookups by event (`hit`, `miss`, `coalesced`, `evicted`, `expired`).
    pub cache_events: CounterVec,
    /// Breaker state transitions by target state.
    pub breaker_transitions: CounterVec,
    /// Backend invocation latency.
    pub backend_latency: HistogramVec,
    /// Settled cost in micro-units per backend.
    pub cost_micro: IntCounterVec,
    /// Audit events dropped because the sink channel was full.
    pub audit_dropped: IntCounter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn init_err(e: prometheus::Error) -> RouterError {
    RouterError::Other(format!("metrics init failed: {e}"))
}

fn build(prefix: &str) -> Result<Metrics, prometheus::Error> {
    let registry = Registry::new();

    let requests_total = CounterVec::new(
        Opts::new(
            format!("{prefix}_requests_total"),
            "Backend attempts by outcome",
        ),
        &["backend", "outcome"],
    )?;
    registry.register(Box::new(requests_total.clone()))?;

    let cache_events = CounterVec::new(
        Opts::new(
            format!("{prefix}_cache_events_total"),
            "Response cache events",
        ),
        &["event"],
    )?;
    registry.register(Box::new(cache_events.clone()))?;

    let breaker_transitions = CounterVec::new(
        Opts::new(
            format!("{prefix}_breaker_transitions_total"),
            "Circuit breaker state transitions",
        ),
        &["backend", "to"],
    )?;
    registry.register(Box::new(breaker_transitions.clone()))?;

    let backend_latency = HistogramVec::new(
        HistogramOpts::new(
            format!("{prefix}_backend_latency_seconds"),
            "Backend invocation latency",
        ),
        &["backend"],
    )?;
    registry.register(Box::new(backend_latency.clone()))?;

    let cost_micro = IntCounterVec::new(
        Opts::new(
            format!("{prefix}_cost_micro_total"),
            "Settled cost in micro-dollars",
        ),
        &["backend"],
    )?;
    registry.register(Box::new(cost_micro.clone()))?;

    let audit_dropped = IntCounter::new(
        format!("{prefix}_audit_dropped_total"),
        "Audit events dropped on a full sink",
    )?;
    registry.register(Box::new(audit_dropped.clone()))?;

    Ok(Metrics {
        registry,
        requests_total,
        cache_events,
        breaker_transitions,
        backend_latency,
        cost_micro,
        audit_dropped,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all metrics in a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`RouterError::Other`] if metric construction or registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), RouterError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = build("edgellm").map_err(init_err)?;
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count one backend attempt with its outcome label.
pub fn inc_request(backend: &str, outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .requests_total
            .get_metric_with_label_values(&[backend, outcome])
        {
            c.inc();
        }
    }
}

/// Count a cache event (`hit`, `miss`, `coalesced`, `evicted`, `expired`).
pub fn inc_cache_event(event: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cache_events.get_metric_with_label_values(&[event]) {
            c.inc();
        }
    }
}

/// Count a breaker transition into state `to`.
pub fn inc_breaker_transition(backend: &str, to: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .breaker_transitions
            .get_metric_with_label_values(&[backend, to])
        {
            c.inc();
        }
    }
}

/// Record the latency of one backend invocation.
pub fn record_backend_latency(backend: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.backend_latency.get_metric_with_label_values(&[backend]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Add settled cost (micro-units) for a backend.
pub fn add_cost_micro(backend: &str, micro: u64) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cost_micro.get_metric_with_label_values(&[backend]) {
            c.inc_by(micro);
        }
    }
}

/// Count an audit event dropped by a saturated sink.
pub fn inc_audit_dropped() {
    if let Some(m) = metrics() {
        m.audit_dropped.inc();
    }
}

/// Encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics are uninitialised or encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Counter values keyed by label, for reports and tests.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Attempt counts keyed by `"backend:outcome"`.
    pub requests_total: HashMap<String, u64>,
    /// Cache event counts keyed by event.
    pub cache_events: HashMap<String, u64>,
}

fn label<'a>(metric: &'a prometheus::proto::Metric, name: &str) -> &'a str {
    metric
        .get_label()
        .iter()
        .find(|l| l.get_name() == name)
        .map_or("unknown", |l| l.get_value())
}

fn summarize(m: &Metrics) -> MetricsSummary {
    let mut summary = MetricsSummary::default();
    for family in m.requests_total.collect() {
        for metric in family.get_metric() {
            let key = format!("{}:{}", label(metric, "backend"), label(metric, "outcome"));
            summary
                .requests_total
                .insert(key, metric.get_counter().get_value() as u64);
        }
    }
    for family in m.cache_events.collect() {
        for metric in family.get_metric() {
            summary.cache_events.insert(
                label(metric, "event").to_string(),
                metric.get_counter().get_value() as u64,
            );
        }
    }
    summary
}

/// Structured summary of the global counters; zeroed before init.
pub fn get_metrics_summary() -> MetricsSummary {
    metrics().map(summarize).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_helpers_do_not_panic_before_or_after_init() {
        inc_request("local-tier-a", "success");
        inc_cache_event("hit");
        let _ = init_metrics();
        inc_breaker_transition("cloud-fallback", "open");
        record_backend_latency("cloud-fallback", Duration::from_millis(12));
        add_cost_micro("cloud-fallback", 800);
        inc_audit_dropped();
    }

    #[test]
    fn test_isolated_bundle_counts_by_label() {
        // The global OnceLock cannot be reset, so exact counts use a local bundle.
        let m = build("t").expect("test: build isolated metrics");
        m.requests_total
            .with_label_values(&["local-tier-a", "success"])
            .inc_by(3.0);
        m.cache_events.with_label_values(&["coalesced"]).inc();

        let summary = summarize(&m);
        assert_eq!(summary.requests_total.get("local-tier-a:success"), Some(&3));
        assert_eq!(summary.cache_events.get("coalesced"), Some(&1));
    }

    #[test]
    fn test_gather_metrics_contains_series_names() {
        let _ = init_metrics();
        inc_request("local-tier-b", "failure");
        let text = gather_metrics();
        assert!(text.contains("edgellm_requests_total"));
    }
}
