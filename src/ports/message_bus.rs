//! Message Bus Port - Publish/Subscribe and Request/Reply Fabric
//!
//! Trait seam over the distribution fabric. The production adapter is
//! NATS; an in-process implementation backs tests and mock mode. The
//! trait-based design keeps the transport swappable.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Bus-level failure classification.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connect failed: {0}")]
    Connect(String),
    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },
    #[error("request to {subject} timed out after {timeout_ms}ms")]
    Timeout { subject: String, timeout_ms: u64 },
    #[error("no responders on {0}")]
    NoResponders(String),
    #[error("subscribe to {0} failed")]
    Subscribe(String),
    #[error("bus connection closed")]
    Closed,
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Reply subject when the sender expects a response.
    pub reply: Option<String>,
}

/// Publish/subscribe + request/reply message fabric.
///
/// Subjects follow NATS conventions: dot-separated tokens, with a
/// trailing `>` wildcard accepted by `subscribe`.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Request/reply round-trip with an explicit timeout.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError>;

    /// Subscribe to a subject (or `>`-suffixed pattern). Messages are
    /// delivered through the returned channel until the bus closes.
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>, BusError>;

    /// Flush pending outbound messages.
    async fn flush(&self) -> Result<(), BusError>;
}

/// Respond to a request-style [`BusMessage`], ignoring fire-and-forget
/// messages that carry no reply subject.
pub async fn respond(
    bus: &dyn MessageBus,
    message: &BusMessage,
    payload: Vec<u8>,
) -> Result<(), BusError> {
    if let Some(reply) = &message.reply {
        bus.publish(reply, payload).await?;
    }
    Ok(())
}
