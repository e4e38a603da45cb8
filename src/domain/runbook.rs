//! Runbook execution records and the external request envelope.
//!
//! Every orchestration invocation produces an immutable
//! [`RunbookExecution`] kept in a bounded in-memory history for audit
//! queries. External callers (console, CLI) speak the
//! [`RunbookRequest`] / [`ExecutionEnvelope`] contract; the transport
//! that carries it is out of scope here.

use std::collections::VecDeque;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::health::HealthReport;

/// Maximum retained runbook executions.
pub const RUNBOOK_HISTORY_LIMIT: usize = 40;

/// Exit code: orchestration succeeded.
pub const EXIT_OK: i32 = 0;
/// Exit code: stage or health failure, rolled back to known-good config.
pub const EXIT_STAGE_FAILED: i32 = 2;
/// Exit code: rollback itself failed; orchestrator is degraded-terminal.
pub const EXIT_ROLLBACK_FAILED: i32 = 4;

/// Supported automation command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunbookCommand {
    Start,
    Stop,
    Restart,
    Failover,
    Failback,
    Drill,
    HealthCheck,
}

impl std::fmt::Display for RunbookCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Failover => "failover",
            Self::Failback => "failback",
            Self::Drill => "drill",
            Self::HealthCheck => "health_check",
        };
        write!(f, "{name}")
    }
}

/// Gateway configuration a command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileName {
    Primary,
    Backup,
}

impl std::fmt::Display for ProfileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Backup => write!(f, "backup"),
        }
    }
}

/// Normalized request payload for executing runbook commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookRequest {
    pub command: RunbookCommand,
    /// `live` or `mock` execution mode.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Trading session window label (`day` / `night`).
    #[serde(default = "default_window")]
    pub window: String,
    /// Operator-facing profile label.
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Explicit config override; failover/failback ignore it.
    #[serde(default)]
    pub config: Option<ProfileName>,
    /// Caller-supplied idempotency key; generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Operator-supplied reason recorded in the audit metadata.
    #[serde(default)]
    pub reason: Option<String>,
    /// Run the embedded health check in enforce mode.
    #[serde(default)]
    pub enforce: bool,
}

fn default_mode() -> String {
    "live".to_string()
}

fn default_window() -> String {
    "day".to_string()
}

fn default_profile() -> String {
    "live".to_string()
}

impl RunbookRequest {
    /// Minimal request for a command with defaults everywhere else.
    pub fn for_command(command: RunbookCommand) -> Self {
        Self {
            command,
            mode: default_mode(),
            window: default_window(),
            profile: default_profile(),
            config: None,
            request_id: None,
            reason: None,
            enforce: false,
        }
    }

    /// Return a copy with a generated request identifier when missing.
    pub fn ensure_request_id(mut self) -> Self {
        if self.request_id.is_none() {
            self.request_id = Some(Uuid::new_v4().simple().to_string());
        }
        self
    }

    /// Effective gateway configuration for this command.
    ///
    /// Failover always targets backup and failback always targets
    /// primary, regardless of any explicit override.
    pub fn normalized_config(&self) -> ProfileName {
        match self.command {
            RunbookCommand::Failover => ProfileName::Backup,
            RunbookCommand::Failback => ProfileName::Primary,
            _ => self.config.unwrap_or(ProfileName::Primary),
        }
    }
}

/// One structured log entry within a runbook execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLog {
    pub stage: String,
    pub outcome: String,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

/// Execution details for a runbook automation command.
///
/// Immutable once finished; sensitive fields are masked before they
/// land in `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookExecution {
    pub request_id: String,
    pub command: RunbookCommand,
    pub mode: String,
    pub window: String,
    pub profile: String,
    pub config: ProfileName,
    pub exit_code: i32,
    pub status: String,
    pub started_at: DateTime<FixedOffset>,
    pub finished_at: DateTime<FixedOffset>,
    pub duration_ms: u64,
    pub stages: Vec<StageLog>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl RunbookExecution {
    /// Whether the execution ended successfully.
    pub fn succeeded(&self) -> bool {
        self.exit_code == EXIT_OK
    }
}

/// Response envelope pairing a runbook record with an optional report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEnvelope {
    pub runbook: RunbookExecution,
    pub health: Option<HealthReport>,
}

/// Bounded, newest-last execution history.
#[derive(Debug, Default)]
pub struct RunbookHistory {
    entries: VecDeque<RunbookExecution>,
}

impl RunbookHistory {
    pub fn push(&mut self, execution: RunbookExecution) {
        self.entries.push_back(execution);
        while self.entries.len() > RUNBOOK_HISTORY_LIMIT {
            self.entries.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&RunbookExecution> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunbookExecution> {
        self.entries.iter()
    }
}
