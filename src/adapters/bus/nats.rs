//! NATS Message Bus Adapter
//!
//! Production implementation of the `MessageBus` port over async-nats.
//! Subscriptions are drained into plain mpsc channels so consumers stay
//! independent of the client library.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::ports::message_bus::{BusError, BusMessage, MessageBus};

/// Channel depth between the NATS subscriber task and the consumer.
const SUBSCRIPTION_BUFFER: usize = 1_024;

/// NATS-backed message bus.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to the configured NATS server.
    pub async fn connect(config: &BusConfig) -> Result<Arc<Self>, BusError> {
        let mut options = async_nats::ConnectOptions::new().name(&config.client_id);
        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            options = options.user_and_password(user.clone(), password.clone());
            info!("NATS authentication configured");
        }

        let client = options
            .connect(config.url.as_str())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        info!(url = %config.url, client_id = %config.client_id, "Connected to NATS");
        Ok(Arc::new(Self { client }))
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let request = self.client.request(subject.to_string(), payload.into());
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(message)) => Ok(message.payload.to_vec()),
            Ok(Err(e)) => {
                let rendered = e.to_string();
                if rendered.contains("no responders") {
                    Err(BusError::NoResponders(subject.to_string()))
                } else {
                    Err(BusError::Publish {
                        subject: subject.to_string(),
                        reason: rendered,
                    })
                }
            }
            Err(_) => Err(BusError::Timeout {
                subject: subject.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|_| BusError::Subscribe(subject.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let subject_owned = subject.to_string();
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let bus_message = BusMessage {
                    subject: message.subject.to_string(),
                    payload: message.payload.to_vec(),
                    reply: message.reply.map(|r| r.to_string()),
                };
                if tx.send(bus_message).await.is_err() {
                    debug!(subject = %subject_owned, "Subscription consumer dropped");
                    break;
                }
            }
            warn!(subject = %subject_owned, "NATS subscription ended");
        });

        Ok(rx)
    }

    async fn flush(&self) -> Result<(), BusError> {
        self.client.flush().await.map_err(|_| BusError::Closed)
    }
}
