//! Circuit Breaker
//!
//! Stops sending traffic to a backend that keeps failing, then lets a single
//! probe through after a cooldown to test recovery.
//!
//! ## States
//! - **Closed**: normal operation, calls flow through
//! - **Open**: backend failing, calls rejected without invoking it
//! - **Half-Open**: exactly one probe call is admitted per cooldown
//!
//! ## Triggers
//! A closed breaker opens when either `consecutive_failures` calls fail in a
//! row, or `window_failures` of the last `window_size` calls failed. Policy is
//! read from [`SharedConfig`] on every call, so a reload applies immediately.
//!
//! ## Usage
//!
//! ```no_run
//! use edgellm_router::{Backend, SharedConfig};
//! use edgellm_router::resilience::BreakerSet;
//!
//! let breakers = BreakerSet::new(SharedConfig::default());
//! let breaker = breakers.get(Backend::LocalTierA);
//! if let Some(permit) = breaker.acquire() {
//!     // ... invoke the backend ...
//!     permit.record(true);
//! };
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::SharedConfig;
use crate::metrics;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Calls flow through normally.
    Closed,
    /// Calls are rejected without invoking the backend.
    Open,
    /// One probe call is allowed through to test recovery.
    HalfOpen,
}

impl CircuitStatus {
    /// Stable snake_case name used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// A state change, broadcast to subscribers of a [`BreakerSet`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerTransition {
    /// Backend whose breaker changed state.
    pub backend: Backend,
    /// Previous state.
    pub from: CircuitStatus,
    /// New state.
    pub to: CircuitStatus,
    /// Wall-clock time of the change.
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, call rejected.
    Open,
    /// The operation ran and failed.
    Failed(E),
}

#[derive(Debug)]
struct BreakerState {
    status: CircuitStatus,
    consecutive_failures: u32,
    /// Recent outcomes, `true` = success. Oldest first.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_state_change: Instant,
    successes: u64,
    failures: u64,
    rejected: u64,
}

enum Admission {
    Rejected,
    Normal,
    Probe,
}

/// Health gate for one backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    backend: Backend,
    state: Mutex<BreakerState>,
    config: SharedConfig,
    events: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreaker {
    /// Create a closed breaker publishing transitions on `events`.
    pub fn new(
        backend: Backend,
        config: SharedConfig,
        events: broadcast::Sender<BreakerTransition>,
    ) -> Self {
        Self {
            backend,
            state: Mutex::new(BreakerState {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                window: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
                last_state_change: Instant::now(),
                successes: 0,
                failures: 0,
                rejected: 0,
            }),
            config,
            events,
        }
    }

    /// Backend guarded by this breaker.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.current().breaker.cooldown_ms)
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitStatus) {
        let from = state.status;
        if from == to {
            return;
        }
        state.status = to;
        state.last_state_change = Instant::now();
        match to {
            CircuitStatus::Open => warn!(backend = %self.backend, from = from.as_str(), "circuit breaker: opening"),
            CircuitStatus::HalfOpen => info!(backend = %self.backend, "circuit breaker: half-open, admitting probe"),
            CircuitStatus::Closed => info!(backend = %self.backend, from = from.as_str(), "circuit breaker: closing"),
        }
        metrics::inc_breaker_transition(self.backend.name(), to.as_str());
        // No subscribers is fine.
        let _ = self.events.send(BreakerTransition {
            backend: self.backend,
            from,
            to,
            at: chrono::Utc::now(),
        });
    }

    fn admit(&self) -> Admission {
        let cooldown = self.cooldown();
        let mut state = self.state.lock();
        match state.status {
            CircuitStatus::Closed => Admission::Normal,
            CircuitStatus::Open => {
                let cooled = state
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= cooldown);
                if cooled {
                    self.transition(&mut state, CircuitStatus::HalfOpen);
                    state.probe_in_flight = true;
                    Admission::Probe
                } else {
                    state.rejected += 1;
                    debug!(backend = %self.backend, "circuit breaker: call rejected (open)");
                    Admission::Rejected
                }
            }
            CircuitStatus::HalfOpen => {
                if state.probe_in_flight {
                    state.rejected += 1;
                    Admission::Rejected
                } else {
                    state.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Whether a call may proceed now.
    ///
    /// `true` when closed, `false` when open within the cooldown, and `true`
    /// exactly once per cooldown while half-open. An admitted half-open probe
    /// must be followed by [`record_result`](Self::record_result); prefer
    /// [`acquire`](Self::acquire), which releases an abandoned probe on drop.
    pub fn allow(&self) -> bool {
        !matches!(self.admit(), Admission::Rejected)
    }

    /// Admit a call and return a permit that records its outcome.
    pub fn acquire(&self) -> Option<BreakerPermit<'_>> {
        match self.admit() {
            Admission::Rejected => None,
            Admission::Normal => Some(BreakerPermit {
                breaker: self,
                probe: false,
                done: false,
            }),
            Admission::Probe => Some(BreakerPermit {
                breaker: self,
                probe: true,
                done: false,
            }),
        }
    }

    /// Record the outcome of an admitted call.
    ///
    /// While half-open the result is taken as the probe's outcome; callers
    /// holding a [`BreakerPermit`] should record through the permit instead.
    pub fn record_result(&self, success: bool) {
        self.record_outcome(success, true);
    }

    /// `probe` is false for calls admitted while closed. Their late results
    /// land in the counters but never resolve a half-open state.
    fn record_outcome(&self, success: bool, probe: bool) {
        let policy = self.config.current().breaker.clone();
        let mut state = self.state.lock();

        if success {
            state.successes += 1;
        } else {
            state.failures += 1;
        }
        if state.status == CircuitStatus::HalfOpen && !probe {
            debug!(backend = %self.backend, success, "circuit breaker: late result ignored while half-open");
            return;
        }

        state.window.push_back(success);
        while state.window.len() > policy.window_size.max(1) {
            state.window.pop_front();
        }

        match state.status {
            CircuitStatus::HalfOpen => {
                state.probe_in_flight = false;
                if success {
                    state.consecutive_failures = 0;
                    state.window.clear();
                    state.opened_at = None;
                    self.transition(&mut state, CircuitStatus::Closed);
                } else {
                    state.opened_at = Some(Instant::now());
                    self.transition(&mut state, CircuitStatus::Open);
                }
            }
            CircuitStatus::Closed => {
                if success {
                    state.consecutive_failures = 0;
                    return;
                }
                state.consecutive_failures += 1;
                let window_failures = state.window.iter().filter(|ok| !**ok).count();
                if state.consecutive_failures >= policy.consecutive_failures
                    || window_failures >= policy.window_failures
                {
                    warn!(
                        backend = %self.backend,
                        consecutive = state.consecutive_failures,
                        window_failures,
                        "circuit breaker: failure threshold reached"
                    );
                    state.opened_at = Some(Instant::now());
                    self.transition(&mut state, CircuitStatus::Open);
                }
            }
            // Late result from a call admitted before the breaker opened.
            CircuitStatus::Open => {}
        }
    }

    fn release_probe(&self) {
        let mut state = self.state.lock();
        if state.status == CircuitStatus::HalfOpen && state.probe_in_flight {
            state.probe_in_flight = false;
            debug!(backend = %self.backend, "circuit breaker: abandoned probe released");
        }
    }

    /// Current status, without admitting anything.
    pub fn status(&self) -> CircuitStatus {
        self.state.lock().status
    }

    /// Whether a call would be admitted right now, without consuming the probe.
    pub fn is_available(&self) -> bool {
        let cooldown = self.cooldown();
        let state = self.state.lock();
        match state.status {
            CircuitStatus::Closed => true,
            CircuitStatus::Open => state.opened_at.map_or(true, |at| at.elapsed() >= cooldown),
            CircuitStatus::HalfOpen => !state.probe_in_flight,
        }
    }

    /// Counters and state for reports.
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            window_failures: state.window.iter().filter(|ok| !**ok).count(),
            successes: state.successes,
            failures: state.failures,
            rejected: state.rejected,
            time_in_current_state: state.last_state_change.elapsed(),
        }
    }

    /// Manually close the breaker and clear its history.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.window.clear();
        state.opened_at = None;
        state.probe_in_flight = false;
        self.transition(&mut state, CircuitStatus::Closed);
        info!(backend = %self.backend, "circuit breaker: manually reset");
    }

    /// Force the breaker open (maintenance, drills).
    pub fn trip(&self) {
        let mut state = self.state.lock();
        state.opened_at = Some(Instant::now());
        state.probe_in_flight = false;
        self.transition(&mut state, CircuitStatus::Open);
    }

    /// Run `f` through the breaker, recording its outcome.
    ///
    /// # Errors
    ///
    /// [`CircuitBreakerError::Open`] if the call was not admitted, otherwise
    /// [`CircuitBreakerError::Failed`] wrapping the operation's error.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().ok_or(CircuitBreakerError::Open)?;
        let result = f().await;
        permit.record(result.is_ok());
        result.map_err(CircuitBreakerError::Failed)
    }
}

/// Admission to call a backend; records exactly one outcome.
///
/// Dropping an unrecorded permit (for example when the dispatch future is
/// cancelled) releases a half-open probe without counting a result.
#[must_use = "an unrecorded permit counts as an abandoned call"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    done: bool,
}

impl BreakerPermit<'_> {
    /// Whether this permit is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record the call's outcome.
    pub fn record(mut self, success: bool) {
        self.done = true;
        self.breaker.record_outcome(success, self.probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.done && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Breaker counters.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Current state.
    pub status: CircuitStatus,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Failures in the sliding window.
    pub window_failures: usize,
    /// Lifetime successful calls.
    pub successes: u64,
    /// Lifetime failed calls.
    pub failures: u64,
    /// Calls rejected without invoking the backend.
    pub rejected: u64,
    /// Time spent in the current state.
    #[serde(with = "duration_ms")]
    pub time_in_current_state: Duration,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

// ── Breaker set ──────────────────────────────────────────────────────────

/// Availability of every backend at one instant.
///
/// Passed into the routing engine so that `decide` stays a pure function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    available: [bool; 3],
}

impl HealthSnapshot {
    /// Every backend available.
    pub fn all_available() -> Self {
        Self {
            available: [true; 3],
        }
    }

    /// Copy with one backend marked unavailable.
    pub fn without(mut self, backend: Backend) -> Self {
        self.available[backend.index()] = false;
        self
    }

    /// Whether the backend's breaker would admit a call.
    pub fn is_available(&self, backend: Backend) -> bool {
        self.available[backend.index()]
    }
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self::all_available()
    }
}

/// One breaker per backend, sharing a transition channel.
#[derive(Debug)]
pub struct BreakerSet {
    breakers: [CircuitBreaker; 3],
    events: broadcast::Sender<BreakerTransition>,
}

impl BreakerSet {
    /// Create closed breakers for every backend.
    pub fn new(config: SharedConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        let breakers =
            Backend::ALL.map(|b| CircuitBreaker::new(b, config.clone(), events.clone()));
        Self { breakers, events }
    }

    /// Breaker for one backend.
    pub fn get(&self, backend: Backend) -> &CircuitBreaker {
        &self.breakers[backend.index()]
    }

    /// Non-consuming availability of every backend.
    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            available: Backend::ALL.map(|b| self.get(b).is_available()),
        }
    }

    /// Subscribe to state transitions of every breaker.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn breaker_with(k: u32, n: usize, f: usize, cooldown_ms: u64) -> CircuitBreaker {
        let mut cfg = EngineConfig::default();
        cfg.breaker.consecutive_failures = k;
        cfg.breaker.window_size = n;
        cfg.breaker.window_failures = f;
        cfg.breaker.cooldown_ms = cooldown_ms;
        let (tx, _) = broadcast::channel(16);
        CircuitBreaker::new(Backend::LocalTierA, SharedConfig::new(cfg), tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let b = breaker_with(3, 20, 20, 1_000);
        for _ in 0..2 {
            assert!(b.allow());
            b.record_result(false);
        }
        assert_eq!(b.status(), CircuitStatus::Closed);
        b.record_result(false);
        assert_eq!(b.status(), CircuitStatus::Open);
        assert!(!b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let b = breaker_with(3, 20, 20, 1_000);
        b.record_result(false);
        b.record_result(false);
        b.record_result(true);
        b.record_result(false);
        b.record_result(false);
        assert_eq!(b.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_on_window_failure_rate() {
        // Alternating outcomes never trip the consecutive trigger.
        let b = breaker_with(10, 6, 3, 1_000);
        for ok in [false, true, false, true] {
            b.record_result(ok);
        }
        assert_eq!(b.status(), CircuitStatus::Closed);
        b.record_result(false);
        assert_eq!(b.status(), CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_forgets_old_failures() {
        let b = breaker_with(10, 3, 2, 1_000);
        b.record_result(false);
        b.record_result(true);
        b.record_result(true);
        // The first failure slid out of the 3-call window.
        b.record_result(false);
        assert_eq!(b.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_probe() {
        let b = breaker_with(1, 20, 20, 1_000);
        b.record_result(false);
        assert!(!b.allow());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(b.allow(), "first call after cooldown is the probe");
        assert_eq!(b.status(), CircuitStatus::HalfOpen);
        assert!(!b.allow());
        assert!(!b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let b = breaker_with(1, 20, 20, 500);
        b.record_result(false);
        tokio::time::advance(Duration::from_millis(500)).await;
        let permit = b.acquire().expect("test: probe admitted");
        assert!(permit.is_probe());
        permit.record(true);
        assert_eq!(b.status(), CircuitStatus::Closed);
        assert!(b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_normal_result_does_not_resolve_half_open() {
        let b = breaker_with(2, 20, 20, 500);
        let slow = b.acquire().expect("test: closed breaker admits");
        assert!(!slow.is_probe());
        b.record_result(false);
        b.record_result(false);
        assert_eq!(b.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        let probe = b.acquire().expect("test: probe admitted");
        assert!(probe.is_probe());

        // The call admitted before the breaker opened finishes now.
        slow.record(true);
        assert_eq!(b.status(), CircuitStatus::HalfOpen);
        assert!(b.acquire().is_none(), "probe still in flight");
        assert_eq!(b.stats().successes, 1);

        probe.record(false);
        assert_eq!(b.status(), CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_normal_failure_does_not_reopen_half_open() {
        let b = breaker_with(1, 20, 20, 500);
        let slow = b.acquire().expect("test: closed breaker admits");
        b.record_result(false);
        tokio::time::advance(Duration::from_millis(500)).await;
        let probe = b.acquire().expect("test: probe admitted");

        slow.record(false);
        assert_eq!(b.status(), CircuitStatus::HalfOpen);
        probe.record(true);
        assert_eq!(b.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_with_fresh_cooldown() {
        let b = breaker_with(1, 20, 20, 500);
        b.record_result(false);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(b.allow());
        tokio::time::advance(Duration::from_millis(400)).await;
        b.record_result(false);
        assert_eq!(b.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!b.allow(), "cooldown restarted at the probe failure");
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_permit_releases_slot() {
        let b = breaker_with(1, 20, 20, 100);
        b.record_result(false);
        tokio::time::advance(Duration::from_millis(100)).await;
        {
            let _permit = b.acquire().expect("test: probe admitted");
            assert!(b.acquire().is_none());
        }
        assert_eq!(b.status(), CircuitStatus::HalfOpen);
        assert!(b.acquire().is_some(), "abandoned probe must be re-admittable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_available_does_not_consume_probe() {
        let b = breaker_with(1, 20, 20, 100);
        b.record_result(false);
        assert!(!b.is_available());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(b.is_available());
        assert!(b.is_available());
        assert_eq!(b.status(), CircuitStatus::Open);
        assert!(b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_broadcast() {
        let set = BreakerSet::new({
            let mut cfg = EngineConfig::default();
            cfg.breaker.consecutive_failures = 1;
            cfg.breaker.cooldown_ms = 10;
            SharedConfig::new(cfg)
        });
        let mut rx = set.subscribe();
        let b = set.get(Backend::CloudFallback);
        b.record_result(false);
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(b.allow());
        b.record_result(true);

        let seen: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|t| (t.backend, t.from, t.to))
            .collect();
        assert_eq!(
            seen,
            vec![
                (Backend::CloudFallback, CircuitStatus::Closed, CircuitStatus::Open),
                (Backend::CloudFallback, CircuitStatus::Open, CircuitStatus::HalfOpen),
                (Backend::CloudFallback, CircuitStatus::HalfOpen, CircuitStatus::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_snapshot_reflects_open_breaker() {
        let set = BreakerSet::new(SharedConfig::default());
        set.get(Backend::LocalTierB).trip();
        let health = set.health();
        assert!(health.is_available(Backend::LocalTierA));
        assert!(!health.is_available(Backend::LocalTierB));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reset_closes() {
        let b = breaker_with(1, 20, 20, 60_000);
        b.trip();
        assert!(!b.allow());
        b.reset();
        assert_eq!(b.status(), CircuitStatus::Closed);
        assert!(b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_wraps_operation() {
        let b = breaker_with(1, 20, 20, 60_000);
        let ok: Result<u32, CircuitBreakerError<&str>> = b.call(|| async { Ok(7) }).await;
        assert!(matches!(ok, Ok(7)));
        let failed: Result<u32, CircuitBreakerError<&str>> = b.call(|| async { Err("boom") }).await;
        assert!(matches!(failed, Err(CircuitBreakerError::Failed("boom"))));
        let rejected: Result<u32, CircuitBreakerError<&str>> = b.call(|| async { Ok(1) }).await;
        assert!(matches!(rejected, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_count_rejections() {
        let b = breaker_with(1, 20, 20, 60_000);
        b.record_result(true);
        b.record_result(false);
        assert!(!b.allow());
        let stats = b.stats();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.status, CircuitStatus::Open);
    }
}
