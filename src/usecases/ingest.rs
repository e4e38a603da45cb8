//! Ingest Pipeline - Bridge Consumer Loop
//!
//! Drains the event bridge on the async side, dispatches the gateway
//! event union exhaustively, and drives translate → publish → note-tick
//! for market data. Per-message failures are contained here; nothing a
//! single event does can stop the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::adapters::bridge::EventBridge;
use crate::adapters::metrics::MetricsRegistry;
use crate::adapters::publisher::TickPublisher;
use crate::adapters::translator::TickTranslator;
use crate::ports::gateway::GatewayEvent;
use crate::usecases::control_plane::SubscriptionRegistry;

/// Poll window for the bridge; bounds how long shutdown can lag.
const RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// Gauge refresh cadence for throughput/backlog.
const METER_INTERVAL: Duration = Duration::from_secs(1);

/// Consumes the event bridge and feeds the publisher.
pub struct IngestPipeline {
    bridge: Arc<EventBridge>,
    translator: TickTranslator,
    publisher: TickPublisher,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<MetricsRegistry>,
}

impl IngestPipeline {
    pub fn new(
        bridge: Arc<EventBridge>,
        translator: TickTranslator,
        publisher: TickPublisher,
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            bridge,
            translator,
            publisher,
            registry,
            metrics,
        }
    }

    /// Run until shutdown. Dequeues in FIFO order on the pipeline's own
    /// schedule; the producer side is never blocked by this loop.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Ingest pipeline started");

        let mut published_since_meter: u64 = 0;
        let mut meter = tokio::time::interval(METER_INTERVAL);
        meter.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Ingest pipeline shutting down");
                    break;
                }
                _ = meter.tick() => {
                    self.metrics
                        .throughput_mps
                        .set(published_since_meter as f64 / METER_INTERVAL.as_secs_f64());
                    published_since_meter = 0;
                    self.metrics.consumer_backlog.set(self.bridge.len() as i64);
                    self.sync_bridge_drops();
                }
                event = self.bridge.recv(RECV_TIMEOUT) => {
                    if let Some(event) = event {
                        if self.handle_event(event).await {
                            published_since_meter += 1;
                        }
                    }
                }
            }
        }
    }

    /// Dispatch one gateway event. Returns true when a tick was published.
    async fn handle_event(&self, event: GatewayEvent) -> bool {
        match event {
            GatewayEvent::Tick(raw) => {
                let Some(tick) = self.translator.translate(&raw) else {
                    return false;
                };
                let delivered = self.publisher.publish(&tick).await;
                // The subscription saw a tick whether or not the bus
                // accepted it; stall detection tracks the gateway side.
                self.registry.note_tick(&tick.vt_symbol(), tick.timestamp).await;
                delivered
            }
            GatewayEvent::Connected => {
                info!("Gateway session connected");
                self.metrics.gateway_connected.set(1);
                false
            }
            GatewayEvent::Disconnected { reason } => {
                warn!(reason = %reason, "Gateway session disconnected");
                self.metrics.gateway_connected.set(0);
                false
            }
            GatewayEvent::Fatal { reason } => {
                error!(reason = %reason, "Gateway reported fatal fault");
                self.metrics.gateway_connected.set(0);
                false
            }
            GatewayEvent::Log { message } => {
                debug!(gateway = %message, "Gateway log");
                false
            }
        }
    }

    /// Mirror the bridge's drop counter into the Prometheus counter.
    fn sync_bridge_drops(&self) {
        let dropped = self.bridge.dropped_total();
        let exported = self.metrics.bridge_dropped_total.get();
        if dropped > exported {
            self.metrics.bridge_dropped_total.inc_by(dropped - exported);
        }
    }
}
