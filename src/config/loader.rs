//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file, parse it into an [`EngineConfig`] and validate it.
//! This is the entry point used at startup and by the hot-reload watcher.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O, parse and validation failures are distinct error variants
//! - The source name is included in every error message
//!
//! ## NOT Responsible For
//! - Watching for changes (that belongs to `watcher`)
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::EngineConfig;

/// Load an [`EngineConfig`] from a TOML file.
///
/// # Errors
///
/// - [`ConfigError::Io`] if the file cannot be read.
/// - [`ConfigError::Parse`] if the TOML is malformed.
/// - [`ConfigError::Validation`] if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load an [`EngineConfig`] from a TOML string.
///
/// `source_name` identifies the input in error messages.
///
/// # Errors
///
/// - [`ConfigError::Parse`] if the TOML is malformed.
/// - [`ConfigError::Validation`] if semantic constraints are violated.
pub fn load_from_str(content: &str, source_name: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[routing]
low_complexity_threshold = 0.25
mid_complexity_threshold = 0.7
tier_a_saturation = 0.8
tier_b_saturation = 0.9

[load]
half_life_ms = 2000

[breaker]
consecutive_failures = 3
window_size = 10
window_failures = 5
cooldown_ms = 1000

[cache]
enabled = true
ttl_secs = 120
capacity = 64

[budget.standard]
period_allowance = 1.5

[budget.premium]
period_allowance = 40.0

[backends.cloud_fallback]
model = "gpt-4o-mini"
cost_per_1k_tokens = 0.002
capacity = 32

[dispatch]
invoke_timeout_ms = 5000
"#;

    #[test]
    fn test_load_from_str_valid_toml_succeeds() {
        let config = load_from_str(VALID_TOML, "test.toml").expect("test: valid config");
        assert!((config.routing.low_complexity_threshold - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.breaker.consecutive_failures, 3);
        assert_eq!(config.cache.capacity, 64);
        assert!((config.budget.standard.period_allowance - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.backends.cloud_fallback.model, "gpt-4o-mini");
        // Untouched profiles keep their defaults.
        assert_eq!(config.backends.local_tier_a.model, "phi4-mini");
    }

    #[test]
    fn test_load_from_file_valid_file_succeeds() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("router.toml");
        let mut f = std::fs::File::create(&path).expect("test: create file");
        f.write_all(VALID_TOML.as_bytes()).expect("test: write");
        drop(f);

        let config = load_from_file(&path).expect("test: load from file");
        assert_eq!(config.dispatch.invoke_timeout_ms, 5000);
    }

    #[test]
    fn test_load_from_file_missing_file_returns_io_error() {
        let result = load_from_file(Path::new("/nonexistent/path/router.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_from_file_invalid_toml_returns_parse_error() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid [[[").expect("test: write");

        assert!(matches!(load_from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_str_invalid_values_returns_validation_error() {
        let toml_str = "[breaker]\nconsecutive_failures = 0\n";
        let result = load_from_str(toml_str, "invalid.toml");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_load_from_str_source_name_appears_in_error() {
        let err = load_from_str("invalid [[[", "my-source.toml")
            .err()
            .expect("test: parse must fail");
        assert!(err.to_string().contains("my-source.toml"));
    }

    #[test]
    fn test_load_from_str_wrong_type_returns_parse_error() {
        let result = load_from_str("[cache]\nttl_secs = \"forever\"\n", "typed.toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
