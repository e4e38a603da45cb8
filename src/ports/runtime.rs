//! Service Runtime Port - Process/Container Lifecycle Capability
//!
//! Narrow interface the orchestrator uses to drive the infrastructure
//! services around the feed (message bus, consumers). Keeps the
//! orchestration state machine independent of the underlying runtime
//! (containers, systemd units, in-process tasks).

use async_trait::async_trait;

/// Start/stop/readiness-probe capability for one named service.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Start the named service. Idempotent on an already-running service.
    async fn start(&self, service: &str) -> anyhow::Result<()>;

    /// Stop the named service. Idempotent on an already-stopped service.
    async fn stop(&self, service: &str) -> anyhow::Result<()>;

    /// Probe readiness. Must return promptly; the orchestrator owns
    /// polling and timeout policy.
    async fn is_ready(&self, service: &str) -> anyhow::Result<bool>;
}
