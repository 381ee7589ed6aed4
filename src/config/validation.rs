//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`EngineConfig`] that the type
//! system cannot express (range checks, cross-field invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::{BackendProfile, EngineConfig};
use crate::routing::config as routing_config;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "breaker.window_size").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn check_profile(name: &str, profile: &BackendProfile, errors: &mut Vec<ConfigError>) {
    if profile.model.trim().is_empty() {
        errors.push(invalid(
            &format!("backends.{name}.model"),
            "",
            "model name must not be empty",
        ));
    }
    if !profile.cost_per_1k_tokens.is_finite() || profile.cost_per_1k_tokens < 0.0 {
        errors.push(invalid(
            &format!("backends.{name}.cost_per_1k_tokens"),
            profile.cost_per_1k_tokens,
            "must be a finite value >= 0",
        ));
    }
    if profile.capacity == 0 {
        errors.push(invalid(
            &format!("backends.{name}.capacity"),
            0,
            "must be at least 1",
        ));
    }
}

/// Validate all semantic constraints on an [`EngineConfig`].
///
/// # Errors
///
/// Returns every violation found, so the operator sees the full scope of
/// issues at once.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &EngineConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Routing thresholds ───────────────────────────────────────────
    for msg in routing_config::validate(&config.routing) {
        errors.push(ConfigError::Validation(format!("routing: {msg}")));
    }

    // ── Load monitor ─────────────────────────────────────────────────
    if config.load.half_life_ms == 0 {
        errors.push(invalid("load.half_life_ms", 0, "must be at least 1ms"));
    }

    // ── Circuit breaker ──────────────────────────────────────────────
    if config.breaker.consecutive_failures == 0 {
        errors.push(invalid("breaker.consecutive_failures", 0, "must be at least 1"));
    }
    if config.breaker.window_size == 0 {
        errors.push(invalid("breaker.window_size", 0, "must be at least 1"));
    }
    if config.breaker.window_failures == 0
        || config.breaker.window_failures > config.breaker.window_size
    {
        errors.push(invalid(
            "breaker.window_failures",
            config.breaker.window_failures,
            "must be in 1..=window_size",
        ));
    }
    if config.breaker.cooldown_ms == 0 {
        errors.push(invalid("breaker.cooldown_ms", 0, "must be at least 1ms"));
    }

    // ── Cache ────────────────────────────────────────────────────────
    if config.cache.enabled && config.cache.ttl_secs == 0 {
        errors.push(invalid(
            "cache.ttl_secs",
            0,
            "ttl must be at least 1s when the cache is enabled",
        ));
    }
    if config.cache.enabled && config.cache.capacity == 0 {
        errors.push(invalid(
            "cache.capacity",
            0,
            "capacity must be at least 1 when the cache is enabled",
        ));
    }

    // ── Budget ───────────────────────────────────────────────────────
    for (field, allowance) in [
        ("budget.standard.period_allowance", config.budget.standard.period_allowance),
        ("budget.premium.period_allowance", config.budget.premium.period_allowance),
    ] {
        if !allowance.is_finite() || allowance < 0.0 {
            errors.push(invalid(field, allowance, "must be a finite value >= 0"));
        }
    }

    // ── Backends ─────────────────────────────────────────────────────
    check_profile("local_tier_a", &config.backends.local_tier_a, &mut errors);
    check_profile("local_tier_b", &config.backends.local_tier_b, &mut errors);
    check_profile("cloud_fallback", &config.backends.cloud_fallback, &mut errors);

    // ── Dispatch ─────────────────────────────────────────────────────
    if config.dispatch.invoke_timeout_ms == 0 {
        errors.push(invalid("dispatch.invoke_timeout_ms", 0, "must be at least 1ms"));
    }
    if config.dispatch.audit_channel_capacity == 0 {
        errors.push(invalid(
            "dispatch.audit_channel_capacity",
            0,
            "channel capacity must be at least 1",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
