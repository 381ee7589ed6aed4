//! Routing configuration types.
//!
//! [`RoutingConfig`] holds the complexity bands and per-tier saturation
//! points read by the decision rules. All fields default sensibly and are
//! (de)serialisable via serde for TOML config files.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ────────────────────────────────────────────

/// Default score below which a prompt is "low complexity".
fn default_low_complexity_threshold() -> f64 {
    0.3
}

/// Default score below which a prompt is "mid complexity".
fn default_mid_complexity_threshold() -> f64 {
    0.6
}

/// Default load at which the fast local tier counts as saturated.
fn default_tier_a_saturation() -> f64 {
    0.8
}

/// Default load at which the secondary local tier counts as saturated.
fn default_tier_b_saturation() -> f64 {
    0.85
}

// ── RoutingConfig ──────────────────────────────────────────────────────

/// Thresholds consulted by [`super::RoutingDecisionEngine`].
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoutingConfig {
    /// Complexity below which the fast local tier is preferred.
    ///
    /// Range: `0.0..=1.0`.  Default: `0.3`.
    #[serde(default = "default_low_complexity_threshold")]
    pub low_complexity_threshold: f64,

    /// Complexity below which the secondary local tier is preferred.
    ///
    /// Range: `0.0..=1.0`, must be `>= low_complexity_threshold`.  Default: `0.6`.
    #[serde(default = "default_mid_complexity_threshold")]
    pub mid_complexity_threshold: f64,

    /// Load of tier A at or above which it is skipped by the low-complexity rule.
    #[serde(default = "default_tier_a_saturation")]
    pub tier_a_saturation: f64,

    /// Load of tier B at or above which it is skipped by the mid-complexity rule.
    #[serde(default = "default_tier_b_saturation")]
    pub tier_b_saturation: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            low_complexity_threshold: default_low_complexity_threshold(),
            mid_complexity_threshold: default_mid_complexity_threshold(),
            tier_a_saturation: default_tier_a_saturation(),
            tier_b_saturation: default_tier_b_saturation(),
        }
    }
}

/// Validate a [`RoutingConfig`], returning a list of human-readable errors.
///
/// An empty `Vec` means the config is usable.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &RoutingConfig) -> Vec<String> {
    let mut errors = Vec::new();

    let in_unit = |v: f64| (0.0..=1.0).contains(&v);

    if !in_unit(config.low_complexity_threshold) {
        errors.push(format!(
            "low_complexity_threshold must be in [0.0, 1.0], got {}",
            config.low_complexity_threshold
        ));
    }

    if !in_unit(config.mid_complexity_threshold) {
        errors.push(format!(
            "mid_complexity_threshold must be in [0.0, 1.0], got {}",
            config.mid_complexity_threshold
        ));
    }

    if config.mid_complexity_threshold < config.low_complexity_threshold {
        errors.push(format!(
            "mid_complexity_threshold ({}) must be >= low_complexity_threshold ({})",
            config.mid_complexity_threshold, config.low_complexity_threshold
        ));
    }

    if !in_unit(config.tier_a_saturation) {
        errors.push(format!(
            "tier_a_saturation must be in [0.0, 1.0], got {}",
            config.tier_a_saturation
        ));
    }

    if !in_unit(config.tier_b_saturation) {
        errors.push(format!(
            "tier_b_saturation must be in [0.0, 1.0], got {}",
            config.tier_b_saturation
        ));
    }

    errors
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_low_complexity_threshold_returns_0_3() {
        assert!((default_low_complexity_threshold() - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_default_mid_complexity_threshold_returns_0_6() {
        assert!((default_mid_complexity_threshold() - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&RoutingConfig::default()).is_empty());
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let cfg = RoutingConfig {
            low_complexity_threshold: -0.1,
            ..RoutingConfig::default()
        };
        let errors = validate(&cfg);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("low_complexity_threshold"));
    }

    #[test]
    fn test_validate_rejects_inverted_bands() {
        let cfg = RoutingConfig {
            low_complexity_threshold: 0.7,
            mid_complexity_threshold: 0.5,
            ..RoutingConfig::default()
        };
        let errors = validate(&cfg);
        assert!(errors.iter().any(|e| e.contains("must be >=")));
    }

    #[test]
    fn test_validate_collects_every_violation() {
        let cfg = RoutingConfig {
            low_complexity_threshold: 2.0,
            mid_complexity_threshold: 1.5,
            tier_a_saturation: -1.0,
            tier_b_saturation: 3.0,
        };
        // low, mid, ordering, a, b
        assert_eq!(validate(&cfg).len(), 5);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: RoutingConfig = toml::from_str("tier_a_saturation = 0.5")
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: parse: {e}")));
        assert!((cfg.tier_a_saturation - 0.5).abs() < f64::EPSILON);
        assert!((cfg.low_complexity_threshold - 0.3).abs() < f64::EPSILON);
    }
}
