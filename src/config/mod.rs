//! Configuration Module - TOML-based Service Configuration
//!
//! Loads and validates configuration from `config.toml`. The resulting
//! `AppConfig` is an immutable value object injected into components at
//! construction; no component reads ambient/global state directly.
//! Credentials are masked in every Debug/log rendering.

pub mod loader;

use serde::Deserialize;

use crate::domain::runbook::ProfileName;
use crate::domain::tick::SerializationStrategy;

/// Mask a secret for logs: short values collapse to `***`, longer ones
/// keep a short prefix and suffix.
pub fn mask_secret(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    if value.len() <= 4 {
        return "***".to_string();
    }
    let prefix_len = if value.len() > 8 { 4 } else { 2 };
    format!("{}...{}", &value[..prefix_len], &value[value.len() - 2..])
}

/// Top-level service configuration.
///
/// Loaded from `config.toml` at startup. All fields are validated
/// before any component is constructed.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Service identity and run mode.
    pub service: ServiceConfig,
    /// Message bus connection.
    pub bus: BusConfig,
    /// Gateway credential profiles and seed subscriptions.
    pub gateway: GatewayConfig,
    /// Event bridge queue sizing.
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Gateway reconnect backoff.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Tick publisher behaviour.
    #[serde(default)]
    pub publisher: PublisherConfig,
    /// Subscription health engine.
    #[serde(default)]
    pub health: HealthConfig,
    /// Control-plane rate limiting.
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    /// Failover orchestration.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Metrics and probes.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Service identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Human-readable service name (also the bus client name).
    pub name: String,
    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Run against the real bus (`live`) or fully in-process (`mock`).
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Gateway connector implementation (`sim` is the in-tree one;
    /// the session factory port is the seam for a vendor binding).
    #[serde(default = "default_connector")]
    pub connector: String,
}

/// Message bus connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// NATS server URL.
    pub url: String,
    /// Client name presented to the bus.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Optional username for authentication.
    pub user: Option<String>,
    /// Optional password for authentication.
    pub password: Option<String>,
    /// Control-plane request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// One gateway credential profile (primary or backup account).
#[derive(Clone, Deserialize)]
pub struct GatewayProfile {
    pub broker_id: String,
    pub user_id: String,
    pub password: String,
    pub md_address: String,
    pub td_address: String,
    pub app_id: String,
    pub auth_code: String,
}

impl GatewayProfile {
    /// Field names that are empty, for validation error messages.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("broker_id", &self.broker_id),
            ("user_id", &self.user_id),
            ("password", &self.password),
            ("md_address", &self.md_address),
            ("td_address", &self.td_address),
            ("app_id", &self.app_id),
            ("auth_code", &self.auth_code),
        ] {
            if value.trim().is_empty() {
                missing.push(name);
            }
        }
        missing
    }
}

impl std::fmt::Debug for GatewayProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayProfile")
            .field("broker_id", &self.broker_id)
            .field("user_id", &mask_secret(&self.user_id))
            .field("password", &"***")
            .field("md_address", &self.md_address)
            .field("td_address", &self.td_address)
            .field("app_id", &self.app_id)
            .field("auth_code", &"***")
            .finish()
    }
}

/// Gateway configuration: credential profiles plus the seed universe.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Profile active at startup; the orchestrator switches it later.
    #[serde(default = "default_route")]
    pub route: ProfileName,
    /// Primary account.
    pub primary: GatewayProfile,
    /// Backup account for failover (must be complete when present).
    pub backup: Option<GatewayProfile>,
    /// Symbols subscribed at startup (vt format `rb2401.SHFE`).
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl GatewayConfig {
    /// Resolve a profile by name; backup requires full configuration.
    pub fn profile(&self, name: ProfileName) -> anyhow::Result<&GatewayProfile> {
        match name {
            ProfileName::Primary => Ok(&self.primary),
            ProfileName::Backup => self
                .backup
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("backup profile is not configured")),
        }
    }
}

/// Event bridge queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Maximum events buffered between the session thread and the
    /// pipeline before the oldest entry is dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Gateway reconnect backoff configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// First retry delay in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    /// Backoff multiplier per attempt.
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    /// Maximum delay in milliseconds.
    #[serde(default = "default_retry_cap_ms")]
    pub cap_ms: u64,
    /// Uniform jitter as a fraction of the computed delay (0..=1).
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: default_retry_base_ms(),
            multiplier: default_retry_multiplier(),
            cap_ms: default_retry_cap_ms(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

/// Tick publisher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Wire serialization strategy.
    #[serde(default)]
    pub strategy: SerializationStrategy,
    /// Maximum publish attempts per message before dropping it.
    #[serde(default = "default_publish_attempts")]
    pub max_attempts: u32,
    /// First retry delay in milliseconds (doubles per attempt).
    #[serde(default = "default_publish_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Per-attempt publish timeout in milliseconds.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            strategy: SerializationStrategy::default(),
            max_attempts: default_publish_attempts(),
            base_delay_ms: default_publish_base_delay_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

/// Subscription health engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Required coverage ratio.
    #[serde(default = "default_coverage_threshold")]
    pub coverage_threshold: f64,
    /// Lag seconds for warning severity.
    #[serde(default = "default_warning_lag")]
    pub lag_warning_secs: f64,
    /// Lag seconds for critical severity.
    #[serde(default = "default_critical_lag")]
    pub lag_critical_secs: f64,
    /// Remediation retries in enforce mode before escalation.
    #[serde(default = "default_remediation_attempts")]
    pub max_remediation_attempts: u32,
    /// Structured log marker emitted on escalation.
    #[serde(default = "default_escalation_marker")]
    pub escalation_marker: String,
    /// Optional external command on escalation; `{marker}` and
    /// `{exit_code}` placeholders are substituted.
    pub escalation_command: Option<String>,
    /// Timeout for the escalation command in seconds.
    #[serde(default = "default_escalation_timeout")]
    pub escalation_timeout_secs: u64,
    /// Symbols carved out of the expected universe.
    #[serde(default)]
    pub ignored_symbols: Vec<String>,
    /// Directory for audit artifacts.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
    /// Seconds between periodic reconciliation cycles.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Mode for the periodic cycle; on-demand checks pick their own.
    #[serde(default = "default_cycle_mode")]
    pub cycle_mode: crate::domain::health::HealthMode,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: default_coverage_threshold(),
            lag_warning_secs: default_warning_lag(),
            lag_critical_secs: default_critical_lag(),
            max_remediation_attempts: default_remediation_attempts(),
            escalation_marker: default_escalation_marker(),
            escalation_command: None,
            escalation_timeout_secs: default_escalation_timeout(),
            ignored_symbols: Vec::new(),
            artifact_dir: default_artifact_dir(),
            cycle_interval_secs: default_cycle_interval(),
            cycle_mode: default_cycle_mode(),
        }
    }
}

/// Control-plane rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum subscribe operations per window.
    #[serde(default = "default_subscribe_limit")]
    pub subscribe_max_per_window: u32,
    /// Sliding window length in seconds.
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            subscribe_max_per_window: default_subscribe_limit(),
            window_secs: default_rate_window(),
        }
    }
}

/// Failover orchestration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Infrastructure services gated during lifecycle sequences.
    #[serde(default = "default_services")]
    pub services: Vec<String>,
    /// Readiness gate timeout in seconds.
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
    /// Readiness poll interval in milliseconds.
    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            readiness_timeout_secs: default_readiness_timeout(),
            readiness_poll_ms: default_readiness_poll_ms(),
        }
    }
}

/// Metrics and probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter + probe server.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Exporter bind address.
    #[serde(default = "default_metrics_addr")]
    pub bind_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_metrics_addr(),
        }
    }
}

// Default value functions for serde

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mode() -> String {
    "live".to_string()
}

fn default_connector() -> String {
    "sim".to_string()
}

fn default_client_id() -> String {
    "marketdata-bridge".to_string()
}

fn default_request_timeout() -> u64 {
    5
}

fn default_route() -> ProfileName {
    ProfileName::Primary
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_cap_ms() -> u64 {
    30_000
}

fn default_jitter_fraction() -> f64 {
    0.2
}

fn default_publish_attempts() -> u32 {
    3
}

fn default_publish_base_delay_ms() -> u64 {
    200
}

fn default_publish_timeout_ms() -> u64 {
    2_000
}

fn default_coverage_threshold() -> f64 {
    0.995
}

fn default_warning_lag() -> f64 {
    120.0
}

fn default_critical_lag() -> f64 {
    300.0
}

fn default_remediation_attempts() -> u32 {
    3
}

fn default_escalation_marker() -> String {
    "subscription_health_escalation".to_string()
}

fn default_escalation_timeout() -> u64 {
    30
}

fn default_artifact_dir() -> String {
    "logs/runbooks".to_string()
}

fn default_cycle_interval() -> u64 {
    60
}

fn default_cycle_mode() -> crate::domain::health::HealthMode {
    crate::domain::health::HealthMode::DryRun
}

fn default_subscribe_limit() -> u32 {
    50
}

fn default_rate_window() -> u64 {
    60
}

fn default_services() -> Vec<String> {
    vec!["nats".to_string()]
}

fn default_readiness_timeout() -> u64 {
    30
}

fn default_readiness_poll_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}
