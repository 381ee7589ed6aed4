//! Audit events and sinks.
//!
//! Every dispatched request produces exactly one [`AuditEvent`]. Events carry
//! a hash of the request, never its content. Recording is fire-and-forget:
//! a slow or failing sink never blocks or fails the request path.
//!
//! Sinks:
//! - [`ChannelAuditSink`]: bounded queue drained by a consumer task; drops
//!   and counts when full
//! - [`TracingAuditSink`]: one JSON line per event on the `audit` target
//! - [`MemoryAuditSink`]: in-process buffer for tests

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::backend::{Backend, DataLocation};
use crate::budget::BudgetStatus;
use crate::metrics;

/// Final outcome of a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// A response was returned (computed or cached).
    Success,
    /// No backend was attempted because the tenant had no budget.
    AdmissionRejected,
    /// Every backend in the cascade failed or was skipped.
    CascadeExhausted,
}

impl AuditOutcome {
    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::AdmissionRejected => "admission_rejected",
            Self::CascadeExhausted => "cascade_exhausted",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    /// Completion time.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Request id for trace correlation.
    pub request_id: String,
    /// Tenant billed.
    pub tenant: String,
    /// Normalised request hash (the cache key).
    pub request_hash: String,
    /// Backend that served the request, if any.
    pub backend: Option<Backend>,
    /// End-to-end latency.
    pub latency_ms: u64,
    /// Cost charged.
    pub cost: f64,
    /// Final outcome.
    pub outcome: AuditOutcome,
    /// Budget situation.
    pub budget_status: BudgetStatus,
    /// Where the data was processed, if it was processed at all.
    pub data_classification: Option<DataLocation>,
    /// Served from the response cache.
    pub cache_hit: bool,
    /// Backends tried.
    pub attempts: u32,
    /// Routing rule that chose the first backend.
    pub rule: Option<&'static str>,
}

/// Destination for audit events.
///
/// `record` must return promptly and must not fail; implementations that do
/// I/O should hand the event to a background task.
pub trait AuditRecorder: Send + Sync {
    /// Record one event.
    fn record(&self, event: AuditEvent);
}

// ── Channel sink ────────────────────────────────────────────────────────

/// Non-blocking sink backed by a bounded channel.
#[derive(Debug)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: AtomicU64,
}

impl ChannelAuditSink {
    /// Create a sink and the receiver a consumer task should drain.
    ///
    /// A `capacity` of zero is treated as one.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the queue was full or the consumer was gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditRecorder for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::inc_audit_dropped();
            // Log the first drop and every 1000th after that.
            if dropped == 1 || dropped % 1000 == 0 {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "full",
                    mpsc::error::TrySendError::Closed(_) => "closed",
                };
                tracing::warn!(dropped, reason, "audit event dropped");
            }
        }
    }
}

// ── Tracing sink ────────────────────────────────────────────────────────

/// Emits each event as a JSON line via `tracing::info!(target: "audit")`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditRecorder for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "audit", event = %json),
            Err(e) => tracing::warn!(error = %e, request_id = %event.request_id, "audit event not serialisable"),
        }
    }
}

// ── Memory sink ─────────────────────────────────────────────────────────

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all recorded events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditRecorder for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
