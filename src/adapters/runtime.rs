//! Bus-Probing Service Runtime
//!
//! Minimal `ServiceRuntime` implementation for deployments where the
//! orchestrator manages the bridge's own collaborators rather than
//! containers: start/stop book-keep the managed set, and readiness
//! probes the message bus round-trip. Container-backed runtimes plug in
//! through the same port.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::ports::message_bus::MessageBus;
use crate::ports::runtime::ServiceRuntime;

/// Tracks managed services and probes the bus for readiness.
pub struct BusProbeRuntime {
    bus: Arc<dyn MessageBus>,
    started: Mutex<HashSet<String>>,
}

impl BusProbeRuntime {
    pub fn new(bus: Arc<dyn MessageBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            started: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl ServiceRuntime for BusProbeRuntime {
    async fn start(&self, service: &str) -> anyhow::Result<()> {
        let newly = self.started.lock().await.insert(service.to_string());
        if newly {
            info!(service, "Service marked started");
        }
        Ok(())
    }

    async fn stop(&self, service: &str) -> anyhow::Result<()> {
        let removed = self.started.lock().await.remove(service);
        if removed {
            info!(service, "Service marked stopped");
        }
        Ok(())
    }

    async fn is_ready(&self, service: &str) -> anyhow::Result<bool> {
        if !self.started.lock().await.contains(service) {
            return Ok(false);
        }
        Ok(self.bus.flush().await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bus::InProcessBus;

    #[tokio::test]
    async fn test_readiness_requires_start() {
        let bus = InProcessBus::new();
        let runtime = BusProbeRuntime::new(bus as Arc<dyn MessageBus>);

        assert!(!runtime.is_ready("nats").await.unwrap());
        runtime.start("nats").await.unwrap();
        assert!(runtime.is_ready("nats").await.unwrap());
        runtime.stop("nats").await.unwrap();
        assert!(!runtime.is_ready("nats").await.unwrap());
    }
}
