//! Failover Orchestrator - Lifecycle State Machine with Rollback
//!
//! Sequences start/stop/restart/failover/failback/drill across the
//! gateway supervisor and the surrounding infrastructure services.
//! Every stage polls readiness under a bounded timeout; a failed gate
//! rolls back to the prior known-good configuration exactly once. A
//! rollback failure is terminal: the orchestrator parks in `Degraded`
//! and keeps reporting rather than retrying silently.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::adapters::gateway::supervisor::{ConnectionState, GatewaySupervisor};
use crate::adapters::metrics::MetricsRegistry;
use crate::config::OrchestratorConfig;
use crate::domain::health::{HealthMode, HealthReport, EXIT_WARNING};
use crate::domain::runbook::{
    ProfileName, RunbookCommand, RunbookExecution, RunbookHistory, RunbookRequest,
    StageLog, EXIT_OK, EXIT_ROLLBACK_FAILED, EXIT_STAGE_FAILED,
};
use crate::domain::tick::now_exchange;
use crate::ports::runtime::ServiceRuntime;
use crate::usecases::health_engine::SubscriptionHealthEngine;

/// Orchestration lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Restarting,
    FailingOver,
    RunningOnBackup,
    FailingBack,
    /// Rollback failed; operator intervention required. The process
    /// stays alive and keeps reporting.
    Degraded,
}

/// Outcome of one executed command, before audit packaging.
struct CommandOutcome {
    exit_code: i32,
    health: Option<HealthReport>,
    detail: Option<String>,
}

impl CommandOutcome {
    fn ok() -> Self {
        Self {
            exit_code: EXIT_OK,
            health: None,
            detail: None,
        }
    }

    fn failed(exit_code: i32, detail: String) -> Self {
        Self {
            exit_code,
            health: None,
            detail: Some(detail),
        }
    }
}

/// Collects stage logs and latencies for the audit record.
struct StageRecorder {
    stages: Vec<StageLog>,
}

impl StageRecorder {
    fn new() -> Self {
        Self { stages: Vec::new() }
    }

    fn record(&mut self, stage: &str, started: Instant, outcome: Result<(), String>) -> u64 {
        let latency_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(()) => info!(stage, latency_ms, "Stage complete"),
            Err(reason) => warn!(stage, latency_ms, reason = %reason, "Stage failed"),
        }
        self.stages.push(StageLog {
            stage: stage.to_string(),
            outcome: match outcome {
                Ok(()) => "success".to_string(),
                Err(_) => "failed".to_string(),
            },
            latency_ms,
            detail: outcome.err(),
        });
        latency_ms
    }
}

/// Sequences multi-component lifecycle operations.
pub struct FailoverOrchestrator {
    runtime: Arc<dyn ServiceRuntime>,
    supervisor: Arc<GatewaySupervisor>,
    health_engine: Arc<SubscriptionHealthEngine>,
    config: OrchestratorConfig,
    metrics: Arc<MetricsRegistry>,
    state: Mutex<OrchestratorState>,
    history: Mutex<RunbookHistory>,
    /// Serializes command execution; lifecycle sequences never overlap.
    exec_lock: tokio::sync::Mutex<()>,
    /// Masked account identifier stamped into audit metadata.
    masked_account: String,
}

impl FailoverOrchestrator {
    pub fn new(
        runtime: Arc<dyn ServiceRuntime>,
        supervisor: Arc<GatewaySupervisor>,
        health_engine: Arc<SubscriptionHealthEngine>,
        config: OrchestratorConfig,
        metrics: Arc<MetricsRegistry>,
        masked_account: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            supervisor,
            health_engine,
            config,
            metrics,
            state: Mutex::new(OrchestratorState::Idle),
            history: Mutex::new(RunbookHistory::default()),
            exec_lock: tokio::sync::Mutex::new(()),
            masked_account,
        })
    }

    pub fn state(&self) -> OrchestratorState {
        *lock_unpoisoned(&self.state)
    }

    /// Snapshot of the bounded audit history, newest last.
    pub fn history(&self) -> Vec<RunbookExecution> {
        lock_unpoisoned(&self.history).iter().cloned().collect()
    }

    /// Execute one runbook command and produce its audit record.
    pub async fn execute(
        &self,
        request: RunbookRequest,
    ) -> (RunbookExecution, Option<HealthReport>) {
        let _guard = self.exec_lock.lock().await;
        let request = request.ensure_request_id();
        let started_at = now_exchange();
        let started = Instant::now();
        let mut recorder = StageRecorder::new();

        info!(
            command = %request.command,
            request_id = request.request_id.as_deref().unwrap_or(""),
            config = %request.normalized_config(),
            "Runbook command accepted"
        );

        let outcome = match request.command {
            RunbookCommand::Start => self.cmd_start(&request, &mut recorder).await,
            RunbookCommand::Stop => self.cmd_stop(&mut recorder).await,
            RunbookCommand::Restart => self.cmd_restart(&request, &mut recorder).await,
            RunbookCommand::Failover => {
                self.cmd_switch(ProfileName::Backup, &mut recorder).await
            }
            RunbookCommand::Failback => {
                self.cmd_switch(ProfileName::Primary, &mut recorder).await
            }
            RunbookCommand::Drill => self.cmd_drill(&request, &mut recorder).await,
            RunbookCommand::HealthCheck => self.cmd_health(&request, &mut recorder).await,
        };

        let finished_at = now_exchange();
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "account".to_string(),
            serde_json::Value::String(self.masked_account.clone()),
        );
        if let Some(reason) = &request.reason {
            metadata.insert(
                "reason".to_string(),
                serde_json::Value::String(reason.clone()),
            );
        }
        if let Some(detail) = &outcome.detail {
            metadata.insert(
                "failure".to_string(),
                serde_json::Value::String(detail.clone()),
            );
        }

        let execution = RunbookExecution {
            request_id: request.request_id.clone().unwrap_or_default(),
            command: request.command,
            mode: request.mode.clone(),
            window: request.window.clone(),
            profile: request.profile.clone(),
            config: request.normalized_config(),
            exit_code: outcome.exit_code,
            status: if outcome.exit_code == EXIT_OK {
                "success".to_string()
            } else {
                "failed".to_string()
            },
            started_at,
            finished_at,
            duration_ms: started.elapsed().as_millis() as u64,
            stages: recorder.stages,
            metadata,
        };

        self.metrics.runbook_exit_code.set(execution.exit_code as i64);
        lock_unpoisoned(&self.history).push(execution.clone());
        (execution, outcome.health)
    }

    // ── Commands ────────────────────────────────────────────

    async fn cmd_start(
        &self,
        request: &RunbookRequest,
        recorder: &mut StageRecorder,
    ) -> CommandOutcome {
        // Idempotency: a running, ready system is not re-initialized.
        if matches!(
            self.state(),
            OrchestratorState::Running | OrchestratorState::RunningOnBackup
        ) && self.all_ready().await
        {
            let started = Instant::now();
            recorder.record("start_noop_already_running", started, Ok(()));
            return CommandOutcome::ok();
        }

        self.set_state(OrchestratorState::Starting);
        let target = request.normalized_config();
        match self.bring_up(target, recorder).await {
            Ok(()) => {
                self.set_state(self.running_state_for(target));
                CommandOutcome::ok()
            }
            Err(reason) => self.rollback_to_stopped(recorder, reason).await,
        }
    }

    async fn cmd_stop(&self, recorder: &mut StageRecorder) -> CommandOutcome {
        // Idempotency: stopping an idle system is a no-op success.
        if self.state() == OrchestratorState::Idle {
            let started = Instant::now();
            recorder.record("stop_noop_already_idle", started, Ok(()));
            return CommandOutcome::ok();
        }

        self.set_state(OrchestratorState::Stopping);
        let outcome = self.bring_down(recorder).await;
        self.set_state(OrchestratorState::Idle);
        match outcome {
            Ok(()) => CommandOutcome::ok(),
            Err(reason) => CommandOutcome::failed(EXIT_STAGE_FAILED, reason),
        }
    }

    async fn cmd_restart(
        &self,
        request: &RunbookRequest,
        recorder: &mut StageRecorder,
    ) -> CommandOutcome {
        self.set_state(OrchestratorState::Restarting);
        if let Err(reason) = self.bring_down(recorder).await {
            self.set_state(OrchestratorState::Idle);
            return CommandOutcome::failed(EXIT_STAGE_FAILED, reason);
        }

        self.set_state(OrchestratorState::Starting);
        let target = request.normalized_config();
        match self.bring_up(target, recorder).await {
            Ok(()) => {
                self.set_state(self.running_state_for(target));
                CommandOutcome::ok()
            }
            Err(reason) => self.rollback_to_stopped(recorder, reason).await,
        }
    }

    /// Shared failover/failback sequence: gate-checked profile switch
    /// with automatic rollback to the previous profile.
    async fn cmd_switch(
        &self,
        target: ProfileName,
        recorder: &mut StageRecorder,
    ) -> CommandOutcome {
        let prior = self.supervisor.active_profile();
        if prior == target {
            let started = Instant::now();
            recorder.record("switch_noop_already_active", started, Ok(()));
            return CommandOutcome::ok();
        }

        let (transition, stage_name) = match target {
            ProfileName::Backup => (OrchestratorState::FailingOver, "failover"),
            ProfileName::Primary => (OrchestratorState::FailingBack, "failback"),
        };
        self.set_state(transition);

        let started = Instant::now();
        self.supervisor.switch_profile(target);
        let gate = self.await_readiness().await;
        let latency_ms = recorder.record(stage_name, started, gate.clone());

        match gate {
            Ok(()) => {
                match target {
                    ProfileName::Backup => {
                        self.metrics.failover_latency_ms.set(latency_ms as f64);
                    }
                    ProfileName::Primary => {
                        self.metrics.failback_latency_ms.set(latency_ms as f64);
                    }
                }
                self.set_state(self.running_state_for(target));
                CommandOutcome::ok()
            }
            Err(reason) => self.rollback_to_profile(prior, recorder, reason).await,
        }
    }

    async fn cmd_drill(
        &self,
        request: &RunbookRequest,
        recorder: &mut StageRecorder,
    ) -> CommandOutcome {
        // Rehearsed failover/failback, each leg gated on health.
        let start = self.cmd_start(request, recorder).await;
        if start.exit_code != EXIT_OK {
            return start;
        }

        let mut last_health = None;
        for (leg, target) in [
            ("drill_health_primary", None),
            ("drill_failover", Some(ProfileName::Backup)),
            ("drill_health_backup", None),
            ("drill_failback", Some(ProfileName::Primary)),
            ("drill_health_restored", None),
        ] {
            match target {
                Some(profile) => {
                    let outcome = self.cmd_switch(profile, recorder).await;
                    if outcome.exit_code != EXIT_OK {
                        return CommandOutcome {
                            health: last_health,
                            ..outcome
                        };
                    }
                }
                None => match self.health_gate(request, leg, recorder).await {
                    Ok(report) => last_health = Some(report),
                    Err(reason) => {
                        return CommandOutcome {
                            exit_code: EXIT_STAGE_FAILED,
                            health: last_health,
                            detail: Some(reason),
                        };
                    }
                },
            }
        }

        CommandOutcome {
            exit_code: EXIT_OK,
            health: last_health,
            detail: None,
        }
    }

    async fn cmd_health(
        &self,
        request: &RunbookRequest,
        recorder: &mut StageRecorder,
    ) -> CommandOutcome {
        let mode = if request.enforce {
            HealthMode::Enforce
        } else {
            HealthMode::DryRun
        };
        let started = Instant::now();
        match self.health_engine.run_cycle(mode).await {
            Ok(report) => {
                let exit_code = report.exit_code;
                recorder.record(
                    "health_check",
                    started,
                    if exit_code <= EXIT_WARNING {
                        Ok(())
                    } else {
                        Err(format!("health exit code {exit_code}"))
                    },
                );
                CommandOutcome {
                    exit_code,
                    health: Some(report),
                    detail: None,
                }
            }
            Err(e) => {
                recorder.record("health_check", started, Err(e.to_string()));
                CommandOutcome::failed(EXIT_STAGE_FAILED, e.to_string())
            }
        }
    }

    // ── Stage primitives ────────────────────────────────────

    async fn bring_up(
        &self,
        target: ProfileName,
        recorder: &mut StageRecorder,
    ) -> Result<(), String> {
        let started = Instant::now();
        self.supervisor.switch_profile(target);
        self.supervisor.ensure_connected().await;
        recorder.record("gateway_connect", started, Ok(()));

        for service in &self.config.services {
            let started = Instant::now();
            let result = self
                .runtime
                .start(service)
                .await
                .map_err(|e| format!("start {service}: {e}"));
            recorder.record(&format!("start_{service}"), started, result.clone());
            result?;
        }

        let started = Instant::now();
        let gate = self.await_readiness().await;
        recorder.record("readiness_gate", started, gate.clone());
        gate
    }

    async fn bring_down(&self, recorder: &mut StageRecorder) -> Result<(), String> {
        let started = Instant::now();
        self.supervisor.disconnect();
        recorder.record("gateway_disconnect", started, Ok(()));

        let mut failures = Vec::new();
        for service in &self.config.services {
            let started = Instant::now();
            let result = self
                .runtime
                .stop(service)
                .await
                .map_err(|e| format!("stop {service}: {e}"));
            recorder.record(&format!("stop_{service}"), started, result.clone());
            if let Err(reason) = result {
                failures.push(reason);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }

    /// Poll services + gateway until all ready or the gate times out.
    async fn await_readiness(&self) -> Result<(), String> {
        let timeout = Duration::from_secs(self.config.readiness_timeout_secs);
        let poll = Duration::from_millis(self.config.readiness_poll_ms);
        let deadline = Instant::now() + timeout;

        loop {
            if self.all_ready().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "readiness gate timed out after {}s",
                    timeout.as_secs()
                ));
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn all_ready(&self) -> bool {
        if *self.supervisor.state().borrow() != ConnectionState::Connected {
            return false;
        }
        for service in &self.config.services {
            match self.runtime.is_ready(service).await {
                Ok(true) => {}
                _ => return false,
            }
        }
        true
    }

    // ── Rollback paths ──────────────────────────────────────

    /// Roll back a failed profile switch. Exactly one attempt: success
    /// leaves the prior configuration running (stage failure, exit 2),
    /// failure parks the orchestrator in Degraded (exit 4).
    async fn rollback_to_profile(
        &self,
        prior: ProfileName,
        recorder: &mut StageRecorder,
        reason: String,
    ) -> CommandOutcome {
        warn!(prior = %prior, reason = %reason, "Stage failed, rolling back to prior profile");
        let started = Instant::now();
        self.supervisor.switch_profile(prior);
        let gate = self.await_readiness().await;
        recorder.record("rollback_to_prior_profile", started, gate.clone());

        match gate {
            Ok(()) => {
                self.set_state(self.running_state_for(prior));
                CommandOutcome::failed(EXIT_STAGE_FAILED, reason)
            }
            Err(rollback_reason) => {
                self.set_state(OrchestratorState::Degraded);
                error!(
                    reason = %reason,
                    rollback_reason = %rollback_reason,
                    "ROLLBACK FAILED, orchestrator degraded, operator intervention required"
                );
                CommandOutcome::failed(
                    EXIT_ROLLBACK_FAILED,
                    format!("{reason}; rollback failed: {rollback_reason}"),
                )
            }
        }
    }

    /// Roll back a failed start by returning to the stopped state.
    async fn rollback_to_stopped(
        &self,
        recorder: &mut StageRecorder,
        reason: String,
    ) -> CommandOutcome {
        warn!(reason = %reason, "Start failed, rolling back to stopped state");
        match self.bring_down(recorder).await {
            Ok(()) => {
                self.set_state(OrchestratorState::Idle);
                CommandOutcome::failed(EXIT_STAGE_FAILED, reason)
            }
            Err(rollback_reason) => {
                self.set_state(OrchestratorState::Degraded);
                error!(
                    reason = %reason,
                    rollback_reason = %rollback_reason,
                    "ROLLBACK FAILED, orchestrator degraded, operator intervention required"
                );
                CommandOutcome::failed(
                    EXIT_ROLLBACK_FAILED,
                    format!("{reason}; rollback failed: {rollback_reason}"),
                )
            }
        }
    }

    fn running_state_for(&self, profile: ProfileName) -> OrchestratorState {
        match profile {
            ProfileName::Primary => OrchestratorState::Running,
            ProfileName::Backup => OrchestratorState::RunningOnBackup,
        }
    }

    async fn health_gate(
        &self,
        request: &RunbookRequest,
        stage: &str,
        recorder: &mut StageRecorder,
    ) -> Result<HealthReport, String> {
        let mode = if request.enforce {
            HealthMode::Enforce
        } else {
            HealthMode::DryRun
        };
        let started = Instant::now();
        match self.health_engine.run_cycle(mode).await {
            Ok(report) if report.exit_code <= EXIT_WARNING => {
                recorder.record(stage, started, Ok(()));
                Ok(report)
            }
            Ok(report) => {
                let reason = format!("health gate exit code {}", report.exit_code);
                recorder.record(stage, started, Err(reason.clone()));
                Err(reason)
            }
            Err(e) => {
                let reason = format!("health gate error: {e}");
                recorder.record(stage, started, Err(reason.clone()));
                Err(reason)
            }
        }
    }

    fn set_state(&self, state: OrchestratorState) {
        let mut guard = lock_unpoisoned(&self.state);
        if *guard != state {
            info!(from = ?*guard, to = ?state, "Orchestrator state transition");
            *guard = state;
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
