//! Control Plane - Subscription Registry and Bus Responders
//!
//! Owns the service-side view of active subscriptions and answers the
//! control-plane subjects:
//!
//! - `md.contracts.list`       → expected contract catalogue
//! - `md.subscriptions.active` → active snapshot with last-tick times
//! - `md.subscribe.bulk`       → bulk subscribe, rate limited
//!
//! The data plane (`md.tick.*`) never flows through here.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::metrics::MetricsRegistry;
use crate::config::RateLimitConfig;
use crate::domain::health::SubscriptionEntry;
use crate::domain::tick::{now_exchange, validate_symbol, Exchange};
use crate::ports::message_bus::{respond, BusMessage, MessageBus};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Service-side registry of subscriptions and the contract catalogue.
///
/// Writers: the control plane (subscribe requests) and the ingest
/// pipeline (last-tick advancement). Snapshots are taken wholesale.
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<String, SubscriptionEntry>>,
    catalogue: RwLock<BTreeSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(HashMap::new()),
            catalogue: RwLock::new(BTreeSet::new()),
        })
    }

    /// Replace the expected contract catalogue.
    pub async fn set_catalogue(&self, symbols: BTreeSet<String>) {
        *self.catalogue.write().await = symbols;
    }

    pub async fn catalogue(&self) -> BTreeSet<String> {
        self.catalogue.read().await.clone()
    }

    /// Register a subscription. Idempotent: an existing entry for the
    /// symbol is returned untouched.
    pub async fn subscribe(&self, vt_symbol: &str) -> anyhow::Result<SubscriptionEntry> {
        let vt_symbol = Self::validate_vt(vt_symbol)?;

        let mut subscriptions = self.subscriptions.write().await;
        if let Some(existing) = subscriptions.get(&vt_symbol) {
            return Ok(existing.clone());
        }
        let entry = SubscriptionEntry {
            subscription_id: Uuid::new_v4().simple().to_string(),
            symbol: vt_symbol.clone(),
            last_tick_at: None,
            active: true,
        };
        subscriptions.insert(vt_symbol, entry.clone());
        Ok(entry)
    }

    /// Advance the last-tick timestamp, creating the entry when the
    /// gateway streams a contract nobody asked for.
    pub async fn note_tick(&self, vt_symbol: &str, at: chrono::DateTime<chrono::FixedOffset>) {
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions
            .entry(vt_symbol.to_string())
            .and_modify(|entry| entry.last_tick_at = Some(at))
            .or_insert_with(|| SubscriptionEntry {
                subscription_id: Uuid::new_v4().simple().to_string(),
                symbol: vt_symbol.to_string(),
                last_tick_at: Some(at),
                active: true,
            });
    }

    /// Wholesale snapshot of every registered subscription.
    pub async fn snapshot(&self) -> Vec<SubscriptionEntry> {
        let subscriptions = self.subscriptions.read().await;
        let mut entries: Vec<SubscriptionEntry> = subscriptions.values().cloned().collect();
        entries.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        entries
    }

    fn validate_vt(raw: &str) -> anyhow::Result<String> {
        let raw = raw.trim();
        let (base, exchange) = raw
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("symbol {raw} is not in SYMBOL.EXCHANGE form"))?;
        let base = validate_symbol(base)?;
        let exchange = Exchange::parse(exchange)?;
        Ok(format!("{base}.{}", exchange.code()))
    }
}

/// Bus-facing responder for the control-plane subjects.
pub struct ControlPlaneService {
    bus: Arc<dyn MessageBus>,
    registry: Arc<SubscriptionRegistry>,
    limiter: DirectLimiter,
    metrics: Arc<MetricsRegistry>,
}

impl ControlPlaneService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<SubscriptionRegistry>,
        rate_limits: &RateLimitConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let max = NonZeroU32::new(rate_limits.subscribe_max_per_window.max(1))
            .unwrap_or(NonZeroU32::MIN);
        let period =
            Duration::from_secs(rate_limits.window_secs.max(1)) / max.get();
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_minute(max))
            .allow_burst(max);
        Arc::new(Self {
            bus,
            registry,
            limiter: RateLimiter::direct(quota),
            metrics,
        })
    }

    /// Serve control-plane requests until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut contracts_rx = self.bus.subscribe("md.contracts.list").await?;
        let mut active_rx = self.bus.subscribe("md.subscriptions.active").await?;
        let mut bulk_rx = self.bus.subscribe("md.subscribe.bulk").await?;

        info!("Control plane responders ready");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Control plane shutting down");
                    return Ok(());
                }
                Some(message) = contracts_rx.recv() => {
                    self.handle_contracts_list(&message).await;
                }
                Some(message) = active_rx.recv() => {
                    self.handle_active_snapshot(&message).await;
                }
                Some(message) = bulk_rx.recv() => {
                    self.handle_subscribe_bulk(&message).await;
                }
                else => return Ok(()),
            }
        }
    }

    async fn handle_contracts_list(&self, message: &BusMessage) {
        let symbols: Vec<String> = self.registry.catalogue().await.into_iter().collect();
        let payload = json!({
            "symbols": symbols,
            "source": "catalogue",
            "ts": now_exchange().to_rfc3339(),
        });
        self.reply(message, &payload).await;
    }

    async fn handle_active_snapshot(&self, message: &BusMessage) {
        let snapshot = self.registry.snapshot().await;
        let payload = json!({
            "subscriptions": snapshot,
            "source": "registry",
            "ts": now_exchange().to_rfc3339(),
        });
        self.reply(message, &payload).await;
    }

    async fn handle_subscribe_bulk(&self, message: &BusMessage) {
        let symbols = parse_bulk_symbols(&message.payload);

        let mut accepted: Vec<String> = Vec::new();
        let mut rejected: Vec<serde_json::Value> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for symbol in symbols {
            if !seen.insert(symbol.clone()) {
                continue;
            }
            if self.limiter.check().is_err() {
                self.metrics.rate_limit_hits.inc();
                rejected.push(json!({"symbol": symbol, "reason": "rate limit exceeded"}));
                continue;
            }
            match self.registry.subscribe(&symbol).await {
                Ok(entry) => accepted.push(entry.symbol),
                Err(e) => {
                    rejected.push(json!({"symbol": symbol, "reason": e.to_string()}));
                }
            }
        }

        info!(
            accepted = accepted.len(),
            rejected = rejected.len(),
            "Bulk subscribe handled"
        );
        let payload = json!({
            "accepted": accepted,
            "rejected": rejected,
            "ts": now_exchange().to_rfc3339(),
        });
        self.reply(message, &payload).await;
    }

    async fn reply(&self, message: &BusMessage, payload: &serde_json::Value) {
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        if let Err(e) = respond(self.bus.as_ref(), message, bytes).await {
            warn!(subject = %message.subject, error = %e, "Control plane reply failed");
        }
    }
}

fn parse_bulk_symbols(payload: &[u8]) -> Vec<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).unwrap_or_default();
    value
        .get("symbols")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
