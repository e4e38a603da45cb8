//! Subscription coverage evaluation.
//!
//! Pure computation of a [`HealthReport`] from the expected contract
//! catalogue and the active-subscription snapshot. No I/O here; the
//! health engine use case owns loading, remediation, and escalation.

use std::collections::BTreeSet;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Exit code: feed healthy.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code: reviewable warnings (stalls below critical, unexpected actives).
pub const EXIT_WARNING: i32 = 1;
/// Exit code: remediation or escalation required.
pub const EXIT_ERROR: i32 = 2;

/// Reconciliation mode for a health cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthMode {
    /// Read-only report.
    DryRun,
    /// Report + remediate gaps through the control plane.
    Enforce,
    /// Report + persist a JSON artifact, no remediation.
    Audit,
}

impl std::fmt::Display for HealthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DryRun => write!(f, "dry-run"),
            Self::Enforce => write!(f, "enforce"),
            Self::Audit => write!(f, "audit"),
        }
    }
}

/// Snapshot of one active subscription from the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    /// Control-plane subscription identifier.
    pub subscription_id: String,
    /// vt-style symbol (`rb2401.SHFE`).
    pub symbol: String,
    /// Most recent tick observed for this subscription.
    pub last_tick_at: Option<DateTime<FixedOffset>>,
    /// Whether the subscription is currently active.
    pub active: bool,
}

/// Stall severity thresholds and coverage floor for evaluation.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Required coverage ratio before the feed counts as healthy.
    pub coverage_threshold: f64,
    /// Seconds of tick silence before a warning-severity stall.
    pub warning_lag_secs: f64,
    /// Seconds of tick silence before a critical-severity stall.
    pub critical_lag_secs: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            coverage_threshold: 0.995,
            warning_lag_secs: 120.0,
            critical_lag_secs: 300.0,
        }
    }
}

/// Severity of a stalled contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StallSeverity {
    Warning,
    Critical,
}

/// A contract whose tick stream has gone quiet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalledContract {
    pub symbol: String,
    pub subscription_id: String,
    pub last_tick_at: Option<DateTime<FixedOffset>>,
    /// Observed silence in seconds; absent when no tick was ever seen.
    pub lag_seconds: Option<f64>,
    pub severity: StallSeverity,
}

/// Outcome summary of a remediation pass (enforce mode only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationSummary {
    pub attempted: bool,
    pub attempts: u32,
    pub resubscribed: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub rate_limit_events: u32,
    pub escalated: bool,
}

/// Computed health summary for one reconciliation cycle.
///
/// Immutable snapshot; the health engine is its single writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<FixedOffset>,
    pub mode: HealthMode,
    pub exit_code: i32,
    pub coverage_ratio: f64,
    pub expected_total: usize,
    pub active_total: usize,
    pub matched_total: usize,
    pub ignored_symbols: Vec<String>,
    pub missing_contracts: Vec<String>,
    pub unexpected_contracts: Vec<String>,
    pub stalled_contracts: Vec<StalledContract>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub remediation: Option<RemediationSummary>,
}

impl HealthReport {
    /// Count of critical-severity stalls in this report.
    pub fn critical_stalls(&self) -> usize {
        self.stalled_contracts
            .iter()
            .filter(|s| s.severity == StallSeverity::Critical)
            .count()
    }

    /// Symbols that enforce mode should resubscribe: missing contracts
    /// plus critical-stalled actives.
    pub fn remediation_targets(&self) -> BTreeSet<String> {
        let mut targets: BTreeSet<String> =
            self.missing_contracts.iter().cloned().collect();
        for stall in &self.stalled_contracts {
            if stall.severity == StallSeverity::Critical {
                targets.insert(stall.symbol.clone());
            }
        }
        targets
    }
}

fn classify_stall(
    entry: &SubscriptionEntry,
    now: DateTime<FixedOffset>,
    thresholds: &HealthThresholds,
) -> Option<StalledContract> {
    if !entry.active {
        return None;
    }
    let Some(last_seen) = entry.last_tick_at else {
        // Subscribed but never ticked: treated as the worst case.
        return Some(StalledContract {
            symbol: entry.symbol.clone(),
            subscription_id: entry.subscription_id.clone(),
            last_tick_at: None,
            lag_seconds: None,
            severity: StallSeverity::Critical,
        });
    };

    let lag = (now - last_seen).num_milliseconds() as f64 / 1000.0;
    let lag = lag.max(0.0);
    let severity = if lag >= thresholds.critical_lag_secs {
        StallSeverity::Critical
    } else if lag >= thresholds.warning_lag_secs {
        StallSeverity::Warning
    } else {
        return None;
    };

    Some(StalledContract {
        symbol: entry.symbol.clone(),
        subscription_id: entry.subscription_id.clone(),
        last_tick_at: entry.last_tick_at,
        lag_seconds: Some(lag),
        severity,
    })
}

/// Evaluate feed health against the expected contract universe.
///
/// Pure function: identical inputs produce identical reports.
pub fn evaluate_health(
    expected: &BTreeSet<String>,
    active: &[SubscriptionEntry],
    ignored: &BTreeSet<String>,
    thresholds: &HealthThresholds,
    mode: HealthMode,
    now: DateTime<FixedOffset>,
) -> HealthReport {
    let active_set: BTreeSet<String> = active
        .iter()
        .filter(|e| e.active)
        .map(|e| e.symbol.clone())
        .collect();
    let filtered_expected: BTreeSet<String> =
        expected.difference(ignored).cloned().collect();
    let covered: BTreeSet<String> = filtered_expected
        .intersection(&active_set)
        .cloned()
        .collect();

    let expected_total = filtered_expected.len();
    let matched_total = covered.len();

    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    let coverage_ratio = if expected_total == 0 {
        warnings.push("Expected contract universe is empty".to_string());
        0.0
    } else {
        matched_total as f64 / expected_total as f64
    };

    let missing: Vec<String> =
        filtered_expected.difference(&active_set).cloned().collect();
    let unexpected: Vec<String> =
        active_set.difference(&filtered_expected).cloned().collect();

    let mut stalled = Vec::new();
    let mut critical_count = 0usize;
    let mut warning_count = 0usize;
    for entry in active {
        if let Some(stall) = classify_stall(entry, now, thresholds) {
            match stall.severity {
                StallSeverity::Critical => critical_count += 1,
                StallSeverity::Warning => warning_count += 1,
            }
            stalled.push(stall);
        }
    }

    if expected_total > 0 && coverage_ratio < thresholds.coverage_threshold {
        errors.push(format!(
            "Coverage ratio {coverage_ratio:.6} below threshold {:.3}",
            thresholds.coverage_threshold
        ));
    }
    if !missing.is_empty() {
        errors.push(format!("Missing {} contracts", missing.len()));
    }
    if critical_count > 0 {
        errors.push(format!("Detected {critical_count} critical stalled streams"));
    }
    if warning_count > 0 {
        warnings.push(format!("Detected {warning_count} stalled streams (warning)"));
    }
    if !unexpected.is_empty() {
        warnings.push(format!("Unexpected active contracts: {}", unexpected.len()));
    }

    let exit_code = if !errors.is_empty() {
        EXIT_ERROR
    } else if !warnings.is_empty() {
        EXIT_WARNING
    } else {
        EXIT_SUCCESS
    };

    HealthReport {
        generated_at: now,
        mode,
        exit_code,
        coverage_ratio,
        expected_total,
        active_total: active_set.len(),
        matched_total,
        ignored_symbols: expected.intersection(ignored).cloned().collect(),
        missing_contracts: missing,
        unexpected_contracts: unexpected,
        stalled_contracts: stalled,
        warnings,
        errors,
        remediation: None,
    }
}
