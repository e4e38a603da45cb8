//! Ops Service - Structured Request/Response Envelope
//!
//! External callers (operations console, CLI) drive the orchestrator
//! and health engine through `{command, mode, window, profile, config,
//! request_id}` requests and receive `{runbook, health?}` envelopes.
//! Requests are idempotent on `request_id`: a replayed identifier gets
//! the cached envelope instead of a second execution. The only
//! transport offered here is the `md.ops.execute` bus subject.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::domain::runbook::{
    ExecutionEnvelope, ProfileName, RunbookCommand, RunbookRequest, RUNBOOK_HISTORY_LIMIT,
};
use crate::domain::tick::now_exchange;
use crate::ports::message_bus::{respond, BusMessage, MessageBus};
use crate::usecases::orchestrator::FailoverOrchestrator;

/// Replayable envelopes kept per request id.
const EXECUTION_CACHE_LIMIT: usize = RUNBOOK_HISTORY_LIMIT * 2;

/// Status cache for operations consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsStatus {
    pub active_profile: ProfileName,
    pub active_window: String,
    pub last_exit_codes: HashMap<String, i32>,
    pub last_updated_at: chrono::DateTime<chrono::FixedOffset>,
}

impl Default for OpsStatus {
    fn default() -> Self {
        Self {
            active_profile: ProfileName::Primary,
            active_window: "day".to_string(),
            last_exit_codes: HashMap::new(),
            last_updated_at: now_exchange(),
        }
    }
}

struct ExecutionCache {
    by_request: HashMap<String, ExecutionEnvelope>,
    order: VecDeque<String>,
}

impl ExecutionCache {
    fn insert(&mut self, request_id: String, envelope: ExecutionEnvelope) {
        if self.by_request.insert(request_id.clone(), envelope).is_none() {
            self.order.push_back(request_id);
        }
        while self.order.len() > EXECUTION_CACHE_LIMIT {
            if let Some(evicted) = self.order.pop_front() {
                self.by_request.remove(&evicted);
            }
        }
    }
}

/// Envelope dispatcher in front of the orchestrator.
pub struct OpsService {
    orchestrator: Arc<FailoverOrchestrator>,
    cache: Mutex<ExecutionCache>,
    status: Mutex<OpsStatus>,
}

impl OpsService {
    pub fn new(orchestrator: Arc<FailoverOrchestrator>) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            cache: Mutex::new(ExecutionCache {
                by_request: HashMap::new(),
                order: VecDeque::new(),
            }),
            status: Mutex::new(OpsStatus::default()),
        })
    }

    /// Current status snapshot.
    pub fn status(&self) -> OpsStatus {
        lock_unpoisoned(&self.status).clone()
    }

    /// Execute a runbook request, replaying cached results for
    /// duplicate request ids.
    pub async fn execute(&self, request: RunbookRequest) -> ExecutionEnvelope {
        let request = request.ensure_request_id();
        let request_id = request.request_id.clone().unwrap_or_default();

        if let Some(cached) = lock_unpoisoned(&self.cache).by_request.get(&request_id) {
            info!(request_id = %request_id, "Replaying cached runbook execution");
            return cached.clone();
        }

        let command = request.command;
        let normalized = request.normalized_config();
        let window = request.window.clone();
        let (runbook, health) = self.orchestrator.execute(request).await;

        self.update_status(command, normalized, &window, runbook.exit_code);

        let envelope = ExecutionEnvelope { runbook, health };
        lock_unpoisoned(&self.cache).insert(request_id, envelope.clone());
        envelope
    }

    fn update_status(
        &self,
        command: RunbookCommand,
        normalized: ProfileName,
        window: &str,
        exit_code: i32,
    ) {
        let mut status = lock_unpoisoned(&self.status);
        // Only successful lifecycle changes move the active profile.
        if exit_code == 0 {
            match command {
                RunbookCommand::Failover => status.active_profile = ProfileName::Backup,
                RunbookCommand::Failback => status.active_profile = ProfileName::Primary,
                RunbookCommand::Start | RunbookCommand::Restart | RunbookCommand::Drill => {
                    status.active_profile = normalized;
                }
                RunbookCommand::Stop | RunbookCommand::HealthCheck => {}
            }
        }
        status.active_window = window.to_string();
        status
            .last_exit_codes
            .insert(command.to_string(), exit_code);
        status.last_updated_at = now_exchange();
    }

    /// Serve the envelope contract on `md.ops.execute` until shutdown.
    pub async fn serve(
        self: Arc<Self>,
        bus: Arc<dyn MessageBus>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut requests = bus.subscribe("md.ops.execute").await?;
        info!("Ops envelope responder ready");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Ops service shutting down");
                    return Ok(());
                }
                Some(message) = requests.recv() => {
                    self.handle(&*bus, &message).await;
                }
                else => return Ok(()),
            }
        }
    }

    async fn handle(&self, bus: &dyn MessageBus, message: &BusMessage) {
        let payload = match serde_json::from_slice::<RunbookRequest>(&message.payload) {
            Ok(request) => {
                let envelope = self.execute(request).await;
                serde_json::to_vec(&envelope).unwrap_or_default()
            }
            Err(e) => {
                warn!(error = %e, "Rejected malformed ops request");
                serde_json::to_vec(&json!({"error": format!("invalid request: {e}")}))
                    .unwrap_or_default()
            }
        };
        if let Err(e) = respond(bus, message, payload).await {
            warn!(error = %e, "Ops reply failed");
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
