//! Model catalog and operational reports.
//!
//! Lists the backends each service tier may be served by and assembles the
//! health report exposed by the dispatcher. Per-tenant usage lives in
//! [`crate::routing::cost`] and is re-exported here.

use serde::Serialize;

use crate::backend::{Backend, DataLocation};
use crate::config::BackendsConfig;
use crate::load::LoadMonitor;
use crate::resilience::{BreakerSet, CircuitStatus};
use crate::ServiceTier;

pub use crate::routing::cost::TenantUsage;

/// One entry in a tier's model listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    /// Backend identity.
    pub backend: Backend,
    /// Configured model name.
    pub model: String,
    /// Where data is processed.
    pub location: DataLocation,
    /// Cost per 1 000 tokens.
    pub cost_per_1k_tokens: f64,
}

/// Backends a tier may be served by, in priority order.
///
/// Standard tenants see both local tiers. Premium tenants additionally see
/// the cloud fallback.
pub fn models_for_tier(tier: ServiceTier, backends: &BackendsConfig) -> Vec<ModelInfo> {
    Backend::ALL
        .into_iter()
        .filter(|b| b.is_local() || tier == ServiceTier::Premium)
        .map(|b| {
            let profile = b.profile(backends);
            ModelInfo {
                backend: b,
                model: profile.model.clone(),
                location: b.data_location(),
                cost_per_1k_tokens: profile.cost_per_1k_tokens,
            }
        })
        .collect()
}

/// Health of one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendHealth {
    /// Backend identity.
    pub backend: Backend,
    /// Breaker state.
    pub status: CircuitStatus,
    /// Current utilisation in `[0, 1]`.
    pub load: f64,
    /// Calls currently in flight.
    pub in_flight: u32,
    /// Whether a backend collaborator is registered.
    pub registered: bool,
}

/// Health of every backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// When the report was taken.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// One entry per backend, in priority order.
    pub backends: Vec<BackendHealth>,
}

impl HealthReport {
    /// Build a report from live breaker and load state.
    pub fn collect(
        breakers: &BreakerSet,
        load: &LoadMonitor,
        registered: impl Fn(Backend) -> bool,
    ) -> Self {
        let backends = Backend::ALL
            .into_iter()
            .map(|b| BackendHealth {
                backend: b,
                status: breakers.get(b).status(),
                load: load.current_load(b),
                in_flight: load.in_flight(b),
                registered: registered(b),
            })
            .collect();
        Self {
            timestamp: chrono::Utc::now(),
            backends,
        }
    }

    /// `"healthy"` when every registered backend is closed, `"degraded"` when
    /// some are not, `"unavailable"` when none are.
    pub fn overall(&self) -> &'static str {
        let registered: Vec<_> = self.backends.iter().filter(|b| b.registered).collect();
        let closed = registered
            .iter()
            .filter(|b| b.status == CircuitStatus::Closed)
            .count();
        if registered.is_empty() || closed == 0 {
            "unavailable"
        } else if closed == registered.len() {
            "healthy"
        } else {
            "degraded"
        }
    }

    /// Entry for one backend.
    pub fn get(&self, backend: Backend) -> Option<&BackendHealth> {
        self.backends.iter().find(|h| h.backend == backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharedConfig;

    #[test]
    fn test_standard_tier_lists_local_models_only() {
        let models = models_for_tier(ServiceTier::Standard, &BackendsConfig::default());
        let names: Vec<_> = models.iter().map(|m| m.model.as_str()).collect();
        assert_eq!(names, ["phi4-mini", "mistral-7b"]);
        assert!(models.iter().all(|m| m.location == DataLocation::OnPremise));
    }

    #[test]
    fn test_premium_tier_adds_cloud() {
        let models = models_for_tier(ServiceTier::Premium, &BackendsConfig::default());
        assert_eq!(models.len(), 3);
        assert_eq!(models[2].backend, Backend::CloudFallback);
        assert_eq!(models[2].location, DataLocation::Cloud);
    }

    #[tokio::test]
    async fn test_health_report_reflects_breakers() {
        let config = SharedConfig::default();
        let breakers = BreakerSet::new(config.clone());
        let load = LoadMonitor::new(config);

        let report = HealthReport::collect(&breakers, &load, |_| true);
        assert_eq!(report.overall(), "healthy");

        breakers.get(Backend::CloudFallback).trip();
        let report = HealthReport::collect(&breakers, &load, |_| true);
        assert_eq!(report.overall(), "degraded");
        assert_eq!(
            report.get(Backend::CloudFallback).map(|h| h.status),
            Some(CircuitStatus::Open)
        );
    }

    #[tokio::test]
    async fn test_health_report_ignores_unregistered() {
        let config = SharedConfig::default();
        let breakers = BreakerSet::new(config.clone());
        let load = LoadMonitor::new(config);
        breakers.get(Backend::CloudFallback).trip();
        let report = HealthReport::collect(&breakers, &load, |b| b.is_local());
        assert_eq!(report.overall(), "healthy");

        let none = HealthReport::collect(&breakers, &load, |_| false);
        assert_eq!(none.overall(), "unavailable");
    }
}
