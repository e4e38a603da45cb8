//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, validating all parameters, and
//! providing clear error messages for misconfiguration.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::AppConfig;

/// Load and validate configuration from a TOML file.
///
/// # Errors
/// Returns detailed error if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig> {
    let path = Path::new(path);

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;

    info!(
        service = %config.service.name,
        mode = %config.service.mode,
        symbols = config.gateway.symbols.len(),
        queue_capacity = config.bridge.queue_capacity,
        "Configuration loaded successfully"
    );

    Ok(config)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig =
        toml::from_str(content).with_context(|| "Failed to parse config.toml")?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate all configuration parameters.
fn validate_config(config: &AppConfig) -> Result<()> {
    anyhow::ensure!(
        !config.service.name.trim().is_empty(),
        "service.name must not be empty"
    );
    anyhow::ensure!(
        config.service.mode == "live" || config.service.mode == "mock",
        "service.mode must be 'live' or 'mock', got {}",
        config.service.mode
    );

    anyhow::ensure!(!config.bus.url.trim().is_empty(), "bus.url must not be empty");

    // Primary profile must be complete
    let missing = config.gateway.primary.missing_fields();
    anyhow::ensure!(
        missing.is_empty(),
        "gateway.primary is missing fields: {}",
        missing.join(", ")
    );

    // Backup profile is all-or-nothing: a partial profile would only be
    // discovered during a failover, which is the worst possible moment.
    if let Some(backup) = &config.gateway.backup {
        let missing = backup.missing_fields();
        anyhow::ensure!(
            missing.is_empty(),
            "gateway.backup is partially configured, missing: {}",
            missing.join(", ")
        );
    }

    anyhow::ensure!(
        config.bridge.queue_capacity > 0,
        "bridge.queue_capacity must be positive"
    );

    anyhow::ensure!(config.retry.base_ms > 0, "retry.base_ms must be positive");
    anyhow::ensure!(
        config.retry.multiplier >= 1.0,
        "retry.multiplier must be >= 1.0, got {}",
        config.retry.multiplier
    );
    anyhow::ensure!(
        config.retry.cap_ms >= config.retry.base_ms,
        "retry.cap_ms must be >= retry.base_ms"
    );
    anyhow::ensure!(
        (0.0..=1.0).contains(&config.retry.jitter_fraction),
        "retry.jitter_fraction must be in [0, 1], got {}",
        config.retry.jitter_fraction
    );

    anyhow::ensure!(
        config.publisher.max_attempts >= 1,
        "publisher.max_attempts must be >= 1"
    );
    anyhow::ensure!(
        config.publisher.publish_timeout_ms > 0,
        "publisher.publish_timeout_ms must be positive"
    );

    anyhow::ensure!(
        config.health.coverage_threshold > 0.0 && config.health.coverage_threshold <= 1.0,
        "health.coverage_threshold must be in (0, 1], got {}",
        config.health.coverage_threshold
    );
    anyhow::ensure!(
        config.health.lag_warning_secs > 0.0
            && config.health.lag_critical_secs > config.health.lag_warning_secs,
        "health lag thresholds must satisfy 0 < warning < critical"
    );
    anyhow::ensure!(
        config.health.max_remediation_attempts >= 1,
        "health.max_remediation_attempts must be >= 1"
    );

    anyhow::ensure!(
        config.rate_limits.subscribe_max_per_window > 0,
        "rate_limits.subscribe_max_per_window must be positive"
    );
    anyhow::ensure!(
        config.rate_limits.window_secs > 0,
        "rate_limits.window_secs must be positive"
    );

    anyhow::ensure!(
        config.orchestrator.readiness_timeout_secs > 0,
        "orchestrator.readiness_timeout_secs must be positive"
    );
    anyhow::ensure!(
        config.orchestrator.readiness_poll_ms > 0,
        "orchestrator.readiness_poll_ms must be positive"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [service]
        name = "md-bridge-test"
        mode = "mock"

        [bus]
        url = "nats://127.0.0.1:4222"

        [gateway]
        symbols = ["rb2401.SHFE", "IF2312.CFFEX"]

        [gateway.primary]
        broker_id = "9999"
        user_id = "100001"
        password = "pw"
        md_address = "tcp://1.2.3.4:10211"
        td_address = "tcp://1.2.3.4:10201"
        app_id = "bridge"
        auth_code = "0000"
    "#;

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_config("nonexistent.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_minimal_config_applies_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.bridge.queue_capacity, 10_000);
        assert_eq!(config.publisher.max_attempts, 3);
        assert!((config.health.coverage_threshold - 0.995).abs() < 1e-9);
        assert_eq!(config.health.max_remediation_attempts, 3);
        assert_eq!(config.rate_limits.subscribe_max_per_window, 50);
        assert_eq!(config.gateway.symbols.len(), 2);
        assert!(config.gateway.backup.is_none());
    }

    #[test]
    fn test_partial_backup_profile_rejected() {
        let content = format!(
            "{MINIMAL}\n[gateway.backup]\nbroker_id = \"8888\"\nuser_id = \"b\"\npassword = \"pw\"\nmd_address = \"tcp://5.6.7.8:10211\"\ntd_address = \"\"\napp_id = \"bridge\"\nauth_code = \"0000\"\n"
        );
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("partially configured"));
    }

    #[test]
    fn test_invalid_coverage_threshold_rejected() {
        let content = format!("{MINIMAL}\n[health]\ncoverage_threshold = 1.5\n");
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn test_invalid_jitter_rejected() {
        let content = format!("{MINIMAL}\n[retry]\njitter_fraction = 2.0\n");
        assert!(parse_config(&content).is_err());
    }
}
