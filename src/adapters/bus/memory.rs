//! In-Process Message Bus - Test and Mock-Mode Fabric
//!
//! Channel-backed implementation of the `MessageBus` port with NATS
//! subject semantics (exact match plus a trailing `>` wildcard) and
//! request/reply via unique inbox subjects. Lets the whole service run
//! without a broker for mock mode, drills, and integration tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::ports::message_bus::{BusError, BusMessage, MessageBus};

/// Channel depth per subscription.
const SUBSCRIPTION_BUFFER: usize = 1_024;

struct Subscription {
    pattern: String,
    tx: mpsc::Sender<BusMessage>,
}

/// Channel-backed bus with NATS-style subject matching.
#[derive(Default)]
pub struct InProcessBus {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl InProcessBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn matches(pattern: &str, subject: &str) -> bool {
        if pattern == subject || pattern == ">" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix(".>") {
            return subject.starts_with(prefix)
                && subject.len() > prefix.len()
                && subject.as_bytes()[prefix.len()] == b'.';
        }
        false
    }

    fn deliver(&self, subject: &str, payload: &[u8], reply: Option<&str>) -> usize {
        let mut subscriptions = match self.subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscriptions.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for subscription in subscriptions.iter() {
            if !Self::matches(&subscription.pattern, subject) {
                continue;
            }
            let message = BusMessage {
                subject: subject.to_string(),
                payload: payload.to_vec(),
                reply: reply.map(str::to_string),
            };
            // Full subscriber channels drop, mirroring core NATS
            // at-most-once delivery.
            if subscription.tx.try_send(message).is_ok() {
                delivered += 1;
            } else {
                debug!(subject, pattern = %subscription.pattern, "Subscriber channel full, dropping");
            }
        }
        delivered
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.deliver(subject, &payload, None);
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let inbox = format!("_inbox.{}", Uuid::new_v4().simple());
        let mut rx = self.subscribe(&inbox).await?;

        if self.deliver(subject, &payload, Some(&inbox)) == 0 {
            return Err(BusError::NoResponders(subject.to_string()));
        }

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(message)) => Ok(message.payload),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout {
                subject: subject.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut subscriptions = match self.subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscriptions.push(Subscription {
            pattern: subject.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn flush(&self) -> Result<(), BusError> {
        Ok(())
    }
}
