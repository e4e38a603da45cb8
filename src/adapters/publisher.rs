//! Tick Publisher - Serialization and Bus Delivery with Bounded Retry
//!
//! Serializes each `DomainTick` per the configured strategy and
//! publishes it to the `md.tick.<exchange>.<symbol>` subject. Failed
//! publishes retry with exponential backoff up to a bounded attempt
//! count, then the message is dropped with a metric: an adapter-level
//! backlog must never build up behind a sick bus.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::adapters::metrics::MetricsRegistry;
use crate::config::PublisherConfig;
use crate::domain::tick::{now_exchange, DomainTick, SerializationStrategy};
use crate::ports::message_bus::MessageBus;

/// Encode a tick with the given strategy.
pub fn encode_tick(
    strategy: SerializationStrategy,
    tick: &DomainTick,
) -> anyhow::Result<Vec<u8>> {
    let bytes = match strategy {
        SerializationStrategy::Json => serde_json::to_vec(tick)?,
        SerializationStrategy::Bincode => bincode::serialize(tick)?,
    };
    Ok(bytes)
}

/// Decode a tick with the given strategy (consumer-side helper).
pub fn decode_tick(
    strategy: SerializationStrategy,
    bytes: &[u8],
) -> anyhow::Result<DomainTick> {
    let tick = match strategy {
        SerializationStrategy::Json => serde_json::from_slice(bytes)?,
        SerializationStrategy::Bincode => bincode::deserialize(bytes)?,
    };
    Ok(tick)
}

/// Publishes validated ticks to the data plane.
pub struct TickPublisher {
    bus: Arc<dyn MessageBus>,
    strategy: SerializationStrategy,
    max_attempts: u32,
    base_delay: Duration,
    publish_timeout: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl TickPublisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        config: &PublisherConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            bus,
            strategy: config.strategy,
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            publish_timeout: Duration::from_millis(config.publish_timeout_ms),
            metrics,
        }
    }

    pub fn strategy(&self) -> SerializationStrategy {
        self.strategy
    }

    /// Publish one tick, retrying with backoff. Returns `true` when the
    /// tick was delivered; a drop after exhausted retries is metered and
    /// logged but is not an error to the caller loop.
    pub async fn publish(&self, tick: &DomainTick) -> bool {
        let payload = match encode_tick(self.strategy, tick) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.metrics.publish_failure_total.inc();
                warn!(symbol = %tick.symbol, error = %e, "Tick serialization failed");
                return false;
            }
        };
        let subject = tick.subject();

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.base_delay * 2u32.pow(attempt - 2);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying publish");
                sleep(delay).await;
            }

            let send = self.bus.publish(&subject, payload.clone());
            match tokio::time::timeout(self.publish_timeout, send).await {
                Ok(Ok(())) => {
                    let latency_ms =
                        (now_exchange() - tick.timestamp).num_milliseconds().max(0) as f64;
                    self.metrics.observe_latency(latency_ms);
                    return true;
                }
                Ok(Err(e)) => {
                    warn!(subject = %subject, attempt, error = %e, "Publish failed");
                }
                Err(_) => {
                    warn!(
                        subject = %subject,
                        attempt,
                        timeout_ms = self.publish_timeout.as_millis() as u64,
                        "Publish timed out"
                    );
                }
            }
        }

        self.metrics.publish_failure_total.inc();
        warn!(
            subject = %subject,
            attempts = self.max_attempts,
            "Dropping tick after exhausting publish retries"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tick::Exchange;
    use crate::ports::message_bus::{BusError, BusMessage};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    fn tick() -> DomainTick {
        DomainTick::new(
            "rb2401",
            Exchange::Shfe,
            now_exchange(),
            dec!(3850.0),
            dec!(3),
            None,
            None,
        )
        .unwrap()
    }

    fn publisher_config(max_attempts: u32) -> PublisherConfig {
        PublisherConfig {
            strategy: SerializationStrategy::Json,
            max_attempts,
            base_delay_ms: 1,
            publish_timeout_ms: 100,
        }
    }

    /// Bus that fails the first `failures` publishes, then succeeds.
    struct FlakyBus {
        failures: u32,
        calls: AtomicU32,
        delivered: tokio::sync::Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl FlakyBus {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                delivered: tokio::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageBus for FlakyBus {
        async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(BusError::Publish {
                    subject: subject.to_string(),
                    reason: "connection reset".to_string(),
                });
            }
            self.delivered.lock().await.push((subject.to_string(), payload));
            Ok(())
        }

        async fn request(
            &self,
            subject: &str,
            _payload: Vec<u8>,
            _timeout: Duration,
        ) -> Result<Vec<u8>, BusError> {
            Err(BusError::NoResponders(subject.to_string()))
        }

        async fn subscribe(
            &self,
            _subject: &str,
        ) -> Result<mpsc::Receiver<BusMessage>, BusError> {
            Err(BusError::Closed)
        }

        async fn flush(&self) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_to_derived_subject() {
        let bus = FlakyBus::new(0);
        let metrics = MetricsRegistry::new().unwrap();
        let publisher = TickPublisher::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            &publisher_config(3),
            metrics,
        );

        assert!(publisher.publish(&tick()).await);
        let delivered = bus.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "md.tick.SHFE.rb2401");
        let decoded = decode_tick(SerializationStrategy::Json, &delivered[0].1).unwrap();
        assert_eq!(decoded.symbol, "rb2401");
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let bus = FlakyBus::new(2);
        let metrics = MetricsRegistry::new().unwrap();
        let publisher = TickPublisher::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            &publisher_config(3),
            Arc::clone(&metrics),
        );

        assert!(publisher.publish(&tick()).await);
        assert_eq!(bus.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.publish_failure_total.get(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_with_metric() {
        let bus = FlakyBus::new(10);
        let metrics = MetricsRegistry::new().unwrap();
        let publisher = TickPublisher::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            &publisher_config(3),
            Arc::clone(&metrics),
        );

        assert!(!publisher.publish(&tick()).await);
        // Bounded attempts: exactly max_attempts calls, then a drop.
        assert_eq!(bus.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.publish_failure_total.get(), 1);
    }

    #[test]
    fn test_codec_round_trips() {
        let tick = tick();
        for strategy in [SerializationStrategy::Json, SerializationStrategy::Bincode] {
            let bytes = encode_tick(strategy, &tick).unwrap();
            let back = decode_tick(strategy, &bytes).unwrap();
            assert_eq!(back, tick, "round-trip failed for {strategy:?}");
        }
    }
}
