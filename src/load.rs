//! # Stage: Load Monitor
//!
//! ## Responsibility
//! Track a rolling utilisation estimate in `[0, 1]` for each backend so the
//! routing rules can steer away from saturated local tiers.
//!
//! ## Guarantees
//! - Lazy: the busy-time EMA is decayed from elapsed time on every access;
//!   there is no background timer
//! - Per-backend locking: one `parking_lot::Mutex` per backend, held only for
//!   a few arithmetic operations
//! - Cancellation-safe: an [`InFlightGuard`] dropped mid-call still releases
//!   its in-flight slot and records the busy time
//!
//! ## NOT Responsible For
//! - Deciding what counts as saturated (that belongs to `routing`)
//! - Health tracking (that belongs to `resilience::circuit_breaker`)

use std::f64::consts::LN_2;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::backend::Backend;
use crate::config::SharedConfig;

#[derive(Debug)]
struct LoadCell {
    /// Exponentially decayed sum of busy seconds.
    busy_ema: f64,
    updated: Instant,
    in_flight: u32,
}

impl LoadCell {
    fn new(now: Instant) -> Self {
        Self {
            busy_ema: 0.0,
            updated: now,
            in_flight: 0,
        }
    }

    fn decay_to(&mut self, now: Instant, half_life: Duration) {
        let dt = now.saturating_duration_since(self.updated).as_secs_f64();
        if dt > 0.0 {
            self.busy_ema *= 0.5_f64.powf(dt / half_life.as_secs_f64());
            self.updated = now;
        }
    }

    fn utilisation(&self, half_life: Duration, capacity: u32) -> f64 {
        let capacity = f64::from(capacity.max(1));
        // Steady-state EMA for concurrency c is c * half_life / ln 2.
        let decayed = self.busy_ema * LN_2 / (half_life.as_secs_f64() * capacity);
        let queued = f64::from(self.in_flight) / capacity;
        (decayed + queued).clamp(0.0, 1.0)
    }
}

/// Point-in-time load of every backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadSnapshot {
    loads: [f64; 3],
}

impl LoadSnapshot {
    /// Build a snapshot from explicit values, in [`Backend::ALL`] order.
    ///
    /// Values are clamped to `[0, 1]`.
    pub fn new(tier_a: f64, tier_b: f64, cloud: f64) -> Self {
        Self {
            loads: [tier_a, tier_b, cloud].map(|l| l.clamp(0.0, 1.0)),
        }
    }

    /// Load of one backend.
    pub fn get(&self, backend: Backend) -> f64 {
        self.loads[backend.index()]
    }
}

/// Rolling per-backend utilisation.
#[derive(Debug)]
pub struct LoadMonitor {
    cells: [Mutex<LoadCell>; 3],
    config: SharedConfig,
}

impl LoadMonitor {
    /// Create a monitor reading half-life and capacities from `config`.
    pub fn new(config: SharedConfig) -> Self {
        let now = Instant::now();
        Self {
            cells: [(); 3].map(|_| Mutex::new(LoadCell::new(now))),
            config,
        }
    }

    fn params(&self, backend: Backend) -> (Duration, u32) {
        let cfg = self.config.current();
        (
            Duration::from_millis(cfg.load.half_life_ms.max(1)),
            backend.profile(&cfg.backends).capacity,
        )
    }

    /// Mark the start of a call. The returned guard records the call when
    /// it completes or is dropped.
    pub fn begin(&self, backend: Backend) -> InFlightGuard<'_> {
        self.cells[backend.index()].lock().in_flight += 1;
        InFlightGuard {
            monitor: self,
            backend,
            started_at: Instant::now(),
            success: false,
        }
    }

    /// Fold a finished call into the backend's busy-time estimate.
    pub fn observe(&self, backend: Backend, started_at: Instant, finished_at: Instant, success: bool) {
        let (half_life, _) = self.params(backend);
        let busy = finished_at.saturating_duration_since(started_at).as_secs_f64();
        let mut cell = self.cells[backend.index()].lock();
        let at = finished_at.max(cell.updated);
        cell.decay_to(at, half_life);
        cell.busy_ema += busy;
        tracing::trace!(backend = %backend, busy_s = busy, success, "load sample");
    }

    /// Current utilisation of `backend` in `[0, 1]`.
    pub fn current_load(&self, backend: Backend) -> f64 {
        self.current_load_at(backend, Instant::now())
    }

    /// Utilisation as of `now`.
    pub fn current_load_at(&self, backend: Backend, now: Instant) -> f64 {
        let (half_life, capacity) = self.params(backend);
        let mut cell = self.cells[backend.index()].lock();
        cell.decay_to(now, half_life);
        cell.utilisation(half_life, capacity)
    }

    /// Number of calls currently in flight on `backend`.
    pub fn in_flight(&self, backend: Backend) -> u32 {
        self.cells[backend.index()].lock().in_flight
    }

    /// Load of every backend at the same instant.
    pub fn snapshot(&self) -> LoadSnapshot {
        let now = Instant::now();
        let loads = Backend::ALL.map(|b| self.current_load_at(b, now));
        LoadSnapshot { loads }
    }
}

/// RAII marker for one in-flight backend call.
#[must_use = "dropping the guard immediately ends the in-flight call"]
pub struct InFlightGuard<'a> {
    monitor: &'a LoadMonitor,
    backend: Backend,
    started_at: Instant,
    success: bool,
}

impl InFlightGuard<'_> {
    /// Finish the call with its outcome.
    pub fn complete(mut self, success: bool) {
        self.success = success;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        {
            let mut cell = self.monitor.cells[self.backend.index()].lock();
            cell.in_flight = cell.in_flight.saturating_sub(1);
        }
        self.monitor
            .observe(self.backend, self.started_at, Instant::now(), self.success);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn monitor() -> LoadMonitor {
        let mut cfg = EngineConfig::default();
        cfg.load.half_life_ms = 1_000;
        cfg.backends.local_tier_a.capacity = 4;
        LoadMonitor::new(SharedConfig::new(cfg))
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_backend_has_zero_load() {
        let m = monitor();
        assert!(m.current_load(Backend::LocalTierA).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_rises_with_in_flight_calls() {
        let m = monitor();
        let mut previous = m.current_load(Backend::LocalTierA);
        let mut guards = Vec::new();
        for _ in 0..4 {
            guards.push(m.begin(Backend::LocalTierA));
            let now = m.current_load(Backend::LocalTierA);
            assert!(now >= previous);
            previous = now;
        }
        assert!((previous - 1.0).abs() < 1e-9);
        drop(guards);
        assert_eq!(m.in_flight(Backend::LocalTierA), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_decays_without_traffic() {
        let m = monitor();
        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(2)).await;
        m.observe(Backend::LocalTierA, start, Instant::now(), true);
        let busy = m.current_load(Backend::LocalTierA);
        assert!(busy > 0.0);

        tokio::time::advance(Duration::from_secs(1)).await;
        let half = m.current_load(Backend::LocalTierA);
        assert!((half - busy / 2.0).abs() < 1e-9, "one half-life halves the load");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(m.current_load(Backend::LocalTierA) < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_finishing_before_last_read_is_not_rewound() {
        let m = monitor();
        let start = Instant::now();
        tokio::time::advance(Duration::from_millis(500)).await;
        let finished = Instant::now();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(m.current_load(Backend::LocalTierA), 0.0);

        // Reported after a later read already moved the cell's clock forward.
        m.observe(Backend::LocalTierA, start, finished, true);
        let first = m.current_load(Backend::LocalTierA);
        assert!(first > 0.0 && first <= 1.0);
        assert!((m.current_load(Backend::LocalTierA) - first).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_guard_records_busy_time() {
        let m = monitor();
        {
            let _guard = m.begin(Backend::LocalTierB);
            tokio::time::advance(Duration::from_millis(500)).await;
        }
        assert_eq!(m.in_flight(Backend::LocalTierB), 0);
        assert!(m.current_load(Backend::LocalTierB) > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_is_clamped_to_one() {
        let m = monitor();
        let guards: Vec<_> = (0..10).map(|_| m.begin(Backend::LocalTierA)).collect();
        assert!((m.current_load(Backend::LocalTierA) - 1.0).abs() < f64::EPSILON);
        drop(guards);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_covers_every_backend() {
        let m = monitor();
        let g = m.begin(Backend::CloudFallback);
        let snap = m.snapshot();
        assert!(snap.get(Backend::CloudFallback) > 0.0);
        assert!(snap.get(Backend::LocalTierA).abs() < f64::EPSILON);
        g.complete(true);
    }

    #[test]
    fn test_snapshot_new_clamps() {
        let snap = LoadSnapshot::new(1.5, -0.2, 0.4);
        assert!((snap.get(Backend::LocalTierA) - 1.0).abs() < f64::EPSILON);
        assert!(snap.get(Backend::LocalTierB).abs() < f64::EPSILON);
    }
}
