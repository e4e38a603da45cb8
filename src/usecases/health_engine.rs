//! Subscription Health Engine - Coverage Reconciliation and Remediation
//!
//! Each cycle loads the expected catalogue and the active-subscription
//! snapshot over the control plane, evaluates coverage (pure domain
//! logic), and in enforce mode drives bounded remediation through
//! `md.subscribe.bulk`. When remediation attempts are exhausted and the
//! feed is still unhealthy, exactly one escalation is emitted per cycle
//! (structured log marker + optional external command).

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::DateTime;
use serde_json::json;
use tracing::{error, info, warn};

use crate::adapters::metrics::MetricsRegistry;
use crate::config::HealthConfig;
use crate::domain::health::{
    evaluate_health, HealthMode, HealthReport, HealthThresholds, RemediationSummary,
    SubscriptionEntry, EXIT_ERROR,
};
use crate::domain::tick::{exchange_offset, now_exchange};
use crate::ports::message_bus::MessageBus;

/// Reconciles subscriptions against the expected contract universe.
pub struct SubscriptionHealthEngine {
    bus: Arc<dyn MessageBus>,
    config: HealthConfig,
    request_timeout: Duration,
    metrics: Arc<MetricsRegistry>,
    escalations: AtomicU64,
}

impl SubscriptionHealthEngine {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        config: HealthConfig,
        request_timeout: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            request_timeout,
            metrics,
            escalations: AtomicU64::new(0),
        })
    }

    /// Escalations emitted since startup.
    pub fn escalations_total(&self) -> u64 {
        self.escalations.load(Ordering::Relaxed)
    }

    fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            coverage_threshold: self.config.coverage_threshold,
            warning_lag_secs: self.config.lag_warning_secs,
            critical_lag_secs: self.config.lag_critical_secs,
        }
    }

    fn ignored(&self) -> BTreeSet<String> {
        self.config
            .ignored_symbols
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Run one reconciliation cycle.
    pub async fn run_cycle(&self, mode: HealthMode) -> anyhow::Result<HealthReport> {
        let expected = self.load_catalogue().await?;
        let active = self.load_active().await?;
        let ignored = self.ignored();
        let thresholds = self.thresholds();

        let mut report = evaluate_health(
            &expected,
            &active,
            &ignored,
            &thresholds,
            mode,
            now_exchange(),
        );

        if mode == HealthMode::Enforce && report.exit_code >= EXIT_ERROR {
            report = self.remediate(report, &expected, &ignored, &thresholds).await;
        }

        self.export_gauges(&report);

        if mode == HealthMode::Audit {
            match self.write_artifact(&report) {
                Ok(path) => info!(path = %path.display(), "Health artifact written"),
                Err(e) => warn!(error = %e, "Health artifact write failed"),
            }
        }

        info!(
            mode = %mode,
            exit_code = report.exit_code,
            coverage = report.coverage_ratio,
            missing = report.missing_contracts.len(),
            stalled = report.stalled_contracts.len(),
            "Health cycle complete"
        );
        Ok(report)
    }

    /// Bounded remediation loop; re-evaluates after every attempt and
    /// escalates exactly once when the last attempt still fails.
    async fn remediate(
        &self,
        mut report: HealthReport,
        expected: &BTreeSet<String>,
        ignored: &BTreeSet<String>,
        thresholds: &HealthThresholds,
    ) -> HealthReport {
        let max_attempts = self.config.max_remediation_attempts.max(1);
        let mut summary = RemediationSummary {
            attempted: true,
            ..RemediationSummary::default()
        };

        let mut attempts = 0;
        while report.exit_code >= EXIT_ERROR && attempts < max_attempts {
            attempts += 1;
            self.remediation_attempt(&report, attempts, max_attempts, &mut summary)
                .await;

            match self.load_active().await {
                Ok(active) => {
                    report = evaluate_health(
                        expected,
                        &active,
                        ignored,
                        thresholds,
                        HealthMode::Enforce,
                        now_exchange(),
                    );
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Snapshot reload failed after remediation");
                    break;
                }
            }
        }
        summary.attempts = attempts;

        if report.exit_code >= EXIT_ERROR {
            summary.escalated = true;
            self.escalate(&report, attempts).await;
        }

        report.remediation = Some(summary);
        report
    }

    async fn remediation_attempt(
        &self,
        report: &HealthReport,
        attempt: u32,
        max_attempts: u32,
        summary: &mut RemediationSummary,
    ) {
        let targets: Vec<String> = report.remediation_targets().into_iter().collect();
        if targets.is_empty() {
            info!(attempt, max_attempts, "Remediation skipped, nothing to resubscribe");
            return;
        }

        info!(
            attempt,
            max_attempts,
            total = targets.len(),
            "Remediation attempt via bulk resubscribe"
        );

        let payload = json!({ "symbols": targets });
        let response = self
            .bus
            .request(
                "md.subscribe.bulk",
                serde_json::to_vec(&payload).unwrap_or_default(),
                self.request_timeout,
            )
            .await;

        match response {
            Ok(bytes) => {
                let value: serde_json::Value =
                    serde_json::from_slice(&bytes).unwrap_or_default();
                let accepted: Vec<String> = value
                    .get("accepted")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|i| i.as_str())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let rejected = value
                    .get("rejected")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();

                summary.rate_limit_events += rejected
                    .iter()
                    .filter(|entry| {
                        entry
                            .get("reason")
                            .and_then(|r| r.as_str())
                            .is_some_and(|r| r.to_lowercase().contains("rate limit"))
                    })
                    .count() as u32;
                for entry in &rejected {
                    summary.failed.push((
                        entry
                            .get("symbol")
                            .and_then(|s| s.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        entry
                            .get("reason")
                            .and_then(|r| r.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    ));
                }
                info!(
                    attempt,
                    accepted = accepted.len(),
                    rejected = rejected.len(),
                    "Remediation result"
                );
                summary.resubscribed.extend(accepted);
            }
            Err(e) => {
                warn!(attempt, error = %e, "Bulk resubscribe request failed");
                summary
                    .failed
                    .push(("*".to_string(), e.to_string()));
            }
        }
    }

    /// One-shot escalation for this cycle: structured marker log plus
    /// the optional operator-configured external command.
    async fn escalate(&self, report: &HealthReport, attempts: u32) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
        error!(
            marker = %self.config.escalation_marker,
            attempts,
            exit_code = report.exit_code,
            missing = report.missing_contracts.len(),
            stalled = report.stalled_contracts.len(),
            "Health check escalation"
        );

        let Some(template) = &self.config.escalation_command else {
            return;
        };
        let command_line =
            render_escalation_command(template, &self.config.escalation_marker, report.exit_code);
        let mut parts = command_line.split_whitespace();
        let Some(program) = parts.next() else {
            return;
        };

        let mut command = tokio::process::Command::new(program);
        command.args(parts);
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());

        let timeout = Duration::from_secs(self.config.escalation_timeout_secs);
        match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => {
                info!(
                    marker = %self.config.escalation_marker,
                    command = %command_line,
                    exit = output.status.code().unwrap_or(-1),
                    stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Escalation command executed"
                );
            }
            Ok(Err(e)) => {
                error!(
                    marker = %self.config.escalation_marker,
                    command = %command_line,
                    error = %e,
                    "Escalation command failed to start"
                );
            }
            Err(_) => {
                error!(
                    marker = %self.config.escalation_marker,
                    command = %command_line,
                    timeout_secs = self.config.escalation_timeout_secs,
                    "Escalation command timed out"
                );
            }
        }
    }

    async fn load_catalogue(&self) -> anyhow::Result<BTreeSet<String>> {
        let response = self
            .bus
            .request("md.contracts.list", b"{}".to_vec(), self.request_timeout)
            .await
            .context("catalogue request failed")?;
        let value: serde_json::Value =
            serde_json::from_slice(&response).context("catalogue payload is not JSON")?;
        let symbols = value
            .get("symbols")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(symbols)
    }

    async fn load_active(&self) -> anyhow::Result<Vec<SubscriptionEntry>> {
        let response = self
            .bus
            .request(
                "md.subscriptions.active",
                b"{}".to_vec(),
                self.request_timeout,
            )
            .await
            .context("active snapshot request failed")?;
        let value: serde_json::Value =
            serde_json::from_slice(&response).context("snapshot payload is not JSON")?;
        Ok(parse_subscriptions_payload(&value))
    }

    fn export_gauges(&self, report: &HealthReport) {
        self.metrics.coverage_ratio.set(report.coverage_ratio);
        self.metrics
            .missing_total
            .set(report.missing_contracts.len() as i64);
        self.metrics
            .stalled_total
            .set(report.stalled_contracts.len() as i64);
    }

    fn write_artifact(&self, report: &HealthReport) -> anyhow::Result<PathBuf> {
        let dir = PathBuf::from(&self.config.artifact_dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create artifact dir {}", dir.display()))?;
        let ts = report.generated_at.format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("subscription_health_{ts}.json"));
        let payload = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, payload)
            .with_context(|| format!("write artifact {}", path.display()))?;
        Ok(path)
    }
}

/// Substitute the `{marker}` and `{exit_code}` placeholders.
fn render_escalation_command(template: &str, marker: &str, exit_code: i32) -> String {
    template
        .replace("{marker}", marker)
        .replace("{exit_code}", &exit_code.to_string())
}

/// Parse an active-subscription payload leniently.
///
/// Accepts `subscriptions` or `items` arrays holding either bare symbol
/// strings or objects; malformed entries are skipped, never fatal.
fn parse_subscriptions_payload(value: &serde_json::Value) -> Vec<SubscriptionEntry> {
    let items = value
        .get("subscriptions")
        .or_else(|| value.get("items"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match &item {
            serde_json::Value::String(symbol) => {
                let symbol = symbol.trim();
                if symbol.is_empty() {
                    continue;
                }
                entries.push(SubscriptionEntry {
                    subscription_id: symbol.to_string(),
                    symbol: symbol.to_string(),
                    // A bare symbol carries no staleness information;
                    // count it as fresh rather than inventing a stall.
                    last_tick_at: Some(now_exchange()),
                    active: true,
                });
            }
            serde_json::Value::Object(map) => {
                let symbol = map
                    .get("symbol")
                    .or_else(|| map.get("base_symbol"))
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                if symbol.is_empty() {
                    continue;
                }
                let subscription_id = map
                    .get("subscription_id")
                    .or_else(|| map.get("id"))
                    .and_then(|s| s.as_str())
                    .unwrap_or(&symbol)
                    .to_string();
                let last_tick_at = map
                    .get("last_tick_at")
                    .and_then(|s| s.as_str())
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|ts| ts.with_timezone(&exchange_offset()));
                let active = map.get("active").and_then(|a| a.as_bool()).unwrap_or(true);
                entries.push(SubscriptionEntry {
                    subscription_id,
                    symbol,
                    last_tick_at,
                    active,
                });
            }
            _ => {}
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bus::InProcessBus;
    use crate::ports::message_bus::{respond, MessageBus};
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    fn health_config() -> HealthConfig {
        HealthConfig {
            max_remediation_attempts: 3,
            ..HealthConfig::default()
        }
    }

    /// Scripted control plane: fixed catalogue, fixed active set, and a
    /// bulk-subscribe endpoint that accepts everything without actually
    /// fixing anything (persistent gap).
    async fn spawn_stub_control_plane(
        bus: Arc<InProcessBus>,
        catalogue: Vec<&str>,
        active: Vec<&str>,
        bulk_calls: Arc<Mutex<u32>>,
        shutdown_tx: &broadcast::Sender<()>,
    ) {
        let catalogue: Vec<String> = catalogue.into_iter().map(String::from).collect();
        let active: Vec<String> = active.into_iter().map(String::from).collect();

        let mut contracts_rx = bus.subscribe("md.contracts.list").await.unwrap();
        let mut active_rx = bus.subscribe("md.subscriptions.active").await.unwrap();
        let mut bulk_rx = bus.subscribe("md.subscribe.bulk").await.unwrap();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    Some(msg) = contracts_rx.recv() => {
                        let payload = json!({"symbols": catalogue, "source": "stub"});
                        let _ = respond(bus.as_ref(), &msg, serde_json::to_vec(&payload).unwrap()).await;
                    }
                    Some(msg) = active_rx.recv() => {
                        let entries: Vec<serde_json::Value> = active
                            .iter()
                            .map(|s| json!({
                                "symbol": s,
                                "subscription_id": format!("sub-{s}"),
                                "last_tick_at": now_exchange().to_rfc3339(),
                                "active": true,
                            }))
                            .collect();
                        let payload = json!({"subscriptions": entries, "source": "stub"});
                        let _ = respond(bus.as_ref(), &msg, serde_json::to_vec(&payload).unwrap()).await;
                    }
                    Some(msg) = bulk_rx.recv() => {
                        *bulk_calls.lock().unwrap() += 1;
                        let request: serde_json::Value =
                            serde_json::from_slice(&msg.payload).unwrap();
                        let payload = json!({
                            "accepted": request["symbols"],
                            "rejected": [],
                        });
                        let _ = respond(bus.as_ref(), &msg, serde_json::to_vec(&payload).unwrap()).await;
                    }
                    else => return,
                }
            }
        });
    }

    #[tokio::test]
    async fn test_dry_run_healthy_cycle() {
        let bus = InProcessBus::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let bulk_calls = Arc::new(Mutex::new(0));
        spawn_stub_control_plane(
            Arc::clone(&bus),
            vec!["A.SHFE", "B.SHFE"],
            vec!["A.SHFE", "B.SHFE"],
            Arc::clone(&bulk_calls),
            &shutdown_tx,
        )
        .await;

        let metrics = MetricsRegistry::new().unwrap();
        let engine = SubscriptionHealthEngine::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            health_config(),
            Duration::from_secs(1),
            Arc::clone(&metrics),
        );

        let report = engine.run_cycle(HealthMode::DryRun).await.unwrap();
        assert_eq!(report.exit_code, 0);
        assert!((report.coverage_ratio - 1.0).abs() < 1e-9);
        assert!((metrics.coverage_ratio.get() - 1.0).abs() < 1e-9);
        // Dry run never remediates.
        assert_eq!(*bulk_calls.lock().unwrap(), 0);
        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_enforce_exhaustion_escalates_exactly_once() {
        let bus = InProcessBus::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let bulk_calls = Arc::new(Mutex::new(0));
        // D stays missing no matter how often we resubscribe.
        spawn_stub_control_plane(
            Arc::clone(&bus),
            vec!["A.SHFE", "B.SHFE", "C.SHFE", "D.SHFE"],
            vec!["A.SHFE", "B.SHFE", "C.SHFE"],
            Arc::clone(&bulk_calls),
            &shutdown_tx,
        )
        .await;

        let engine = SubscriptionHealthEngine::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            health_config(),
            Duration::from_secs(1),
            MetricsRegistry::new().unwrap(),
        );

        let report = engine.run_cycle(HealthMode::Enforce).await.unwrap();
        assert!(report.exit_code >= EXIT_ERROR);
        assert!((report.coverage_ratio - 0.75).abs() < 1e-9);
        assert_eq!(report.missing_contracts, vec!["D.SHFE".to_string()]);

        let remediation = report.remediation.unwrap();
        assert!(remediation.attempted);
        assert_eq!(remediation.attempts, 3);
        assert!(remediation.escalated);
        // One escalation after the final attempt, not one per attempt.
        assert_eq!(engine.escalations_total(), 1);
        assert_eq!(*bulk_calls.lock().unwrap(), 3);
        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_enforce_skips_remediation_when_healthy() {
        let bus = InProcessBus::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let bulk_calls = Arc::new(Mutex::new(0));
        spawn_stub_control_plane(
            Arc::clone(&bus),
            vec!["A.SHFE"],
            vec!["A.SHFE"],
            Arc::clone(&bulk_calls),
            &shutdown_tx,
        )
        .await;

        let engine = SubscriptionHealthEngine::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            health_config(),
            Duration::from_secs(1),
            MetricsRegistry::new().unwrap(),
        );

        let report = engine.run_cycle(HealthMode::Enforce).await.unwrap();
        assert_eq!(report.exit_code, 0);
        assert!(report.remediation.is_none());
        assert_eq!(*bulk_calls.lock().unwrap(), 0);
        assert_eq!(engine.escalations_total(), 0);
        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_ignored_symbols_carved_out() {
        let bus = InProcessBus::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let bulk_calls = Arc::new(Mutex::new(0));
        spawn_stub_control_plane(
            Arc::clone(&bus),
            vec!["A.SHFE", "DELISTED.SHFE"],
            vec!["A.SHFE"],
            Arc::clone(&bulk_calls),
            &shutdown_tx,
        )
        .await;

        let mut config = health_config();
        config.ignored_symbols = vec!["DELISTED.SHFE".to_string()];
        let engine = SubscriptionHealthEngine::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            config,
            Duration::from_secs(1),
            MetricsRegistry::new().unwrap(),
        );

        let report = engine.run_cycle(HealthMode::DryRun).await.unwrap();
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.expected_total, 1);
        assert_eq!(report.ignored_symbols, vec!["DELISTED.SHFE".to_string()]);
        let _ = shutdown_tx.send(());
    }

    #[test]
    fn test_escalation_command_rendering() {
        let rendered = render_escalation_command(
            "notify-ops --marker {marker} --code {exit_code}",
            "subscription_health_escalation",
            2,
        );
        assert_eq!(
            rendered,
            "notify-ops --marker subscription_health_escalation --code 2"
        );
    }

    #[test]
    fn test_lenient_snapshot_parsing() {
        let payload = json!({
            "subscriptions": [
                "rb2401.SHFE",
                {"symbol": "ag2412.SHFE", "subscription_id": "s1",
                 "last_tick_at": "2026-08-06T09:30:00+08:00", "active": true},
                {"symbol": "", "subscription_id": "broken"},
                {"no_symbol": true},
                42,
            ]
        });
        let entries = parse_subscriptions_payload(&payload);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].symbol, "rb2401.SHFE");
        assert_eq!(entries[1].subscription_id, "s1");
        assert!(entries[1].last_tick_at.is_some());
    }
}
