//! Prometheus Metrics Registry - Feed Observability
//!
//! Registers and exposes the bridge's metric surface on the configured
//! bind address, together with /live and /ready probes. These names are
//! consumed by external dashboards and the operations console; renaming
//! one is a breaking change.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Sliding window length backing the p99 latency gauge.
const LATENCY_WINDOW: usize = 1_024;

/// Small sorted-sample window for percentile gauges.
///
/// The histogram stays the source of truth; this only feeds the
/// pre-computed p99 gauge the operations console reads directly.
pub struct LatencyWindow {
    samples: Mutex<Vec<f64>>,
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::with_capacity(LATENCY_WINDOW)),
        }
    }

    /// Record one latency sample and return the current p99.
    pub fn record(&self, value_ms: f64) -> f64 {
        let mut samples = match self.samples.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if samples.len() == LATENCY_WINDOW {
            samples.remove(0);
        }
        samples.push(value_ms);

        let mut sorted = samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64) * 0.99).ceil() as usize;
        sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
    }
}

/// Centralized Prometheus metrics for the market data bridge.
pub struct MetricsRegistry {
    /// Prometheus registry.
    registry: Registry,
    /// Published ticks per second (sampled by the ingest loop).
    pub throughput_mps: Gauge,
    /// Coverage ratio from the last health cycle.
    pub coverage_ratio: Gauge,
    /// Missing subscriptions from the last health cycle.
    pub missing_total: IntGauge,
    /// Stalled subscriptions from the last health cycle.
    pub stalled_total: IntGauge,
    /// End-to-end publish latency distribution (ms).
    pub latency_ms: Histogram,
    /// Pre-computed p99 publish latency (ms).
    pub latency_ms_p99: Gauge,
    /// Control-plane requests rejected by the rate limiter.
    pub rate_limit_hits: IntCounter,
    /// Malformed gateway events rejected by the validator.
    pub error_count: IntCounter,
    /// Last failover duration (ms).
    pub failover_latency_ms: Gauge,
    /// Last failback duration (ms).
    pub failback_latency_ms: Gauge,
    /// Exit code of the most recent runbook execution.
    pub runbook_exit_code: IntGauge,
    /// Bridge queue backlog.
    pub consumer_backlog: IntGauge,
    /// Events dropped by the bridge under saturation.
    pub bridge_dropped_total: IntCounter,
    /// Ticks dropped after exhausting publish retries.
    pub publish_failure_total: IntCounter,
    /// Gateway session restarts.
    pub gateway_reconnects_total: IntCounter,
    /// Gateway connection status (1 = connected).
    pub gateway_connected: IntGauge,
    /// p99 sample window.
    pub latency_window: LatencyWindow,
}

impl MetricsRegistry {
    /// Create and register all metrics.
    pub fn new() -> anyhow::Result<Arc<Self>> {
        let registry = Registry::new();

        let throughput_mps = Gauge::with_opts(Opts::new(
            "md_throughput_mps",
            "Published market data ticks per second",
        ))?;
        let coverage_ratio = Gauge::with_opts(Opts::new(
            "md_subscription_coverage_ratio",
            "Ratio of active subscriptions versus expected contracts",
        ))?;
        let missing_total = IntGauge::with_opts(Opts::new(
            "md_subscription_missing_total",
            "Number of missing subscriptions detected by health check",
        ))?;
        let stalled_total = IntGauge::with_opts(Opts::new(
            "md_subscription_stalled_total",
            "Number of stalled subscriptions detected by health check",
        ))?;
        let latency_ms = Histogram::with_opts(
            HistogramOpts::new("md_latency_ms", "End-to-end tick publish latency in ms")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
        )?;
        let latency_ms_p99 = Gauge::with_opts(Opts::new(
            "md_latency_ms_p99",
            "p99 end-to-end tick publish latency in ms",
        ))?;
        let rate_limit_hits = IntCounter::with_opts(Opts::new(
            "md_rate_limit_hits",
            "Control-plane operations rejected by rate limiting",
        ))?;
        let error_count = IntCounter::with_opts(Opts::new(
            "md_error_count",
            "Malformed gateway events rejected by validation",
        ))?;
        let failover_latency_ms = Gauge::with_opts(Opts::new(
            "md_failover_latency_ms",
            "Duration of the most recent failover stage in ms",
        ))?;
        let failback_latency_ms = Gauge::with_opts(Opts::new(
            "md_failback_latency_ms",
            "Duration of the most recent failback stage in ms",
        ))?;
        let runbook_exit_code = IntGauge::with_opts(Opts::new(
            "md_runbook_exit_code",
            "Exit code of the most recent runbook execution",
        ))?;
        let consumer_backlog = IntGauge::with_opts(Opts::new(
            "consumer_backlog_messages",
            "Events buffered in the gateway-to-pipeline bridge",
        ))?;
        let bridge_dropped_total = IntCounter::with_opts(Opts::new(
            "md_bridge_dropped_total",
            "Events dropped by the bridge under saturation",
        ))?;
        let publish_failure_total = IntCounter::with_opts(Opts::new(
            "md_publish_failure_total",
            "Ticks dropped after exhausting publish retries",
        ))?;
        let gateway_reconnects_total = IntCounter::with_opts(Opts::new(
            "md_gateway_reconnects_total",
            "Gateway session restarts since startup",
        ))?;
        let gateway_connected = IntGauge::with_opts(Opts::new(
            "md_gateway_connected",
            "Gateway connection status (1=connected, 0=down)",
        ))?;

        registry.register(Box::new(throughput_mps.clone()))?;
        registry.register(Box::new(coverage_ratio.clone()))?;
        registry.register(Box::new(missing_total.clone()))?;
        registry.register(Box::new(stalled_total.clone()))?;
        registry.register(Box::new(latency_ms.clone()))?;
        registry.register(Box::new(latency_ms_p99.clone()))?;
        registry.register(Box::new(rate_limit_hits.clone()))?;
        registry.register(Box::new(error_count.clone()))?;
        registry.register(Box::new(failover_latency_ms.clone()))?;
        registry.register(Box::new(failback_latency_ms.clone()))?;
        registry.register(Box::new(runbook_exit_code.clone()))?;
        registry.register(Box::new(consumer_backlog.clone()))?;
        registry.register(Box::new(bridge_dropped_total.clone()))?;
        registry.register(Box::new(publish_failure_total.clone()))?;
        registry.register(Box::new(gateway_reconnects_total.clone()))?;
        registry.register(Box::new(gateway_connected.clone()))?;

        Ok(Arc::new(Self {
            registry,
            throughput_mps,
            coverage_ratio,
            missing_total,
            stalled_total,
            latency_ms,
            latency_ms_p99,
            rate_limit_hits,
            error_count,
            failover_latency_ms,
            failback_latency_ms,
            runbook_exit_code,
            consumer_backlog,
            bridge_dropped_total,
            publish_failure_total,
            gateway_reconnects_total,
            gateway_connected,
            latency_window: LatencyWindow::new(),
        }))
    }

    /// Observe one end-to-end publish latency sample.
    pub fn observe_latency(&self, latency_ms: f64) {
        self.latency_ms.observe(latency_ms);
        let p99 = self.latency_window.record(latency_ms);
        self.latency_ms_p99.set(p99);
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Serve /metrics, /live, and /ready on the configured bind address.
    pub async fn serve(
        self: Arc<Self>,
        bind_address: String,
        ready_rx: watch::Receiver<bool>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        #[derive(Clone)]
        struct AppState {
            metrics: Arc<MetricsRegistry>,
            ready: watch::Receiver<bool>,
        }

        let state = AppState {
            metrics: Arc::clone(&self),
            ready: ready_rx,
        };

        let app = Router::new()
            .route(
                "/metrics",
                get(|State(state): State<AppState>| async move { state.metrics.render() }),
            )
            .route("/live", get(|| async { StatusCode::OK }))
            .route(
                "/ready",
                get(|State(state): State<AppState>| async move {
                    if *state.ready.borrow() {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}
