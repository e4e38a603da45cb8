//! Market Data Bridge — Entry Point
//!
//! Supervises a blocking exchange gateway session, bridges its events
//! into the async pipeline, and publishes validated ticks to NATS.
//! Runs until SIGINT/SIGTERM.
//!
//! Wiring sequence:
//! 1. Load config.toml + validate
//! 2. Init tracing (JSON structured logging)
//! 3. Shutdown broadcast + readiness watch
//! 4. Metrics registry + /metrics + probes server
//! 5. Message bus (NATS, or in-process in mock mode)
//! 6. Event bridge + session factory + gateway supervisor
//! 7. Subscription registry + control plane responders
//! 8. Ingest pipeline (bridge → validate → publish)
//! 9. Health engine periodic reconciliation cycles
//! 10. Failover orchestrator + ops envelope responder
//! 11. Wait for SIGINT → graceful shutdown

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

mod adapters;
mod config;
mod domain;
mod ports;
mod usecases;

use adapters::bridge::EventBridge;
use adapters::bus::{InProcessBus, NatsBus};
use adapters::gateway::{GatewaySupervisor, SimGatewayConfig, SimSessionFactory};
use adapters::metrics::MetricsRegistry;
use adapters::publisher::TickPublisher;
use adapters::runtime::BusProbeRuntime;
use adapters::translator::TickTranslator;
use ports::gateway::{EventSink, SessionFactory};
use ports::message_bus::MessageBus;
use ports::runtime::ServiceRuntime;
use usecases::{
    ControlPlaneService, FailoverOrchestrator, IngestPipeline, OpsService,
    SubscriptionHealthEngine, SubscriptionRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load configuration from config.toml ──────────────
    let config = config::loader::load_config("config.toml")
        .context("Failed to load configuration")?;

    // ── 2. Initialize structured JSON logging ───────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(&config.service.log_level)
            }),
        )
        .json()
        .init();

    info!(
        name = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        mode = %config.service.mode,
        connector = %config.service.connector,
        symbols = config.gateway.symbols.len(),
        "Starting market data bridge"
    );

    // ── 3. Shutdown signal channels ─────────────────────────
    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(8);
    let (ready_tx, ready_rx) = watch::channel(true);

    // ── 4. Metrics registry + exporter ──────────────────────
    let metrics = MetricsRegistry::new().context("Failed to build metrics registry")?;
    let metrics_handle = if config.metrics.enabled {
        let server = Arc::clone(&metrics);
        let bind = config.metrics.bind_address.clone();
        let shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = server.serve(bind, ready_rx, shutdown).await {
                error!(error = %e, "Metrics server failed");
            }
        }))
    } else {
        None
    };

    // ── 5. Message bus ──────────────────────────────────────
    let bus: Arc<dyn MessageBus> = if config.service.mode == "mock" {
        info!("Mock mode: using in-process message bus");
        InProcessBus::new()
    } else {
        NatsBus::connect(&config.bus)
            .await
            .context("Failed to connect to NATS")?
    };

    // ── 6. Event bridge + gateway supervisor ────────────────
    let bridge = EventBridge::new(config.bridge.queue_capacity);
    let factory = build_session_factory(&config)?;
    let supervisor = GatewaySupervisor::new(
        factory,
        Arc::clone(&bridge) as Arc<dyn EventSink>,
        config.gateway.clone(),
        &config.retry,
    );

    // ── 7. Subscription registry + control plane ────────────
    let registry = SubscriptionRegistry::new();
    registry
        .set_catalogue(config.gateway.symbols.iter().cloned().collect::<BTreeSet<_>>())
        .await;
    for vt_symbol in &config.gateway.symbols {
        if let Err(e) = registry.subscribe(vt_symbol).await {
            warn!(symbol = %vt_symbol, error = %e, "Seed subscription rejected");
        }
    }
    let control_plane = ControlPlaneService::new(
        Arc::clone(&bus),
        Arc::clone(&registry),
        &config.rate_limits,
        Arc::clone(&metrics),
    );
    let control_plane_handle = tokio::spawn({
        let service = Arc::clone(&control_plane);
        let shutdown = shutdown_tx.subscribe();
        async move {
            if let Err(e) = service.run(shutdown).await {
                error!(error = %e, "Control plane failed");
            }
        }
    });

    // ── 8. Ingest pipeline ──────────────────────────────────
    let pipeline = IngestPipeline::new(
        Arc::clone(&bridge),
        TickTranslator::new(Arc::clone(&metrics)),
        TickPublisher::new(Arc::clone(&bus), &config.publisher, Arc::clone(&metrics)),
        Arc::clone(&registry),
        Arc::clone(&metrics),
    );
    let pipeline_handle = tokio::spawn(pipeline.run(shutdown_tx.subscribe()));

    // ── 9. Health engine + periodic reconciliation ──────────
    let health_engine = SubscriptionHealthEngine::new(
        Arc::clone(&bus),
        config.health.clone(),
        Duration::from_secs(config.bus.request_timeout_secs),
        Arc::clone(&metrics),
    );
    let health_handle = tokio::spawn({
        let engine = Arc::clone(&health_engine);
        let mut shutdown = shutdown_tx.subscribe();
        let interval = Duration::from_secs(config.health.cycle_interval_secs.max(1));
        let mode = config.health.cycle_mode;
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick consumed
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.run_cycle(mode).await {
                            warn!(error = %e, "Health cycle failed");
                        }
                    }
                }
            }
        }
    });

    // ── 10. Orchestrator + ops envelope responder ───────────
    let runtime = BusProbeRuntime::new(Arc::clone(&bus));
    let orchestrator = FailoverOrchestrator::new(
        Arc::clone(&runtime) as Arc<dyn ServiceRuntime>,
        Arc::clone(&supervisor),
        Arc::clone(&health_engine),
        config.orchestrator.clone(),
        Arc::clone(&metrics),
        config::mask_secret(&config.gateway.primary.user_id),
    );
    // The bridge's own collaborators count as started at boot.
    for service in &config.orchestrator.services {
        let _ = runtime.start(service).await;
    }
    let ops = OpsService::new(Arc::clone(&orchestrator));
    let ops_handle = tokio::spawn({
        let ops = Arc::clone(&ops);
        let bus = Arc::clone(&bus);
        let shutdown = shutdown_tx.subscribe();
        async move {
            if let Err(e) = ops.serve(bus, shutdown).await {
                error!(error = %e, "Ops service failed");
            }
        }
    });

    // Bring the gateway up; readiness flows through the state watch.
    let supervisor_handle = supervisor.connect();

    // Mirror the supervisor's reconnect counter into the metrics surface.
    let reconnect_meter_handle = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        let metrics = Arc::clone(&metrics);
        let mut shutdown = shutdown_tx.subscribe();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => return,
                    _ = ticker.tick() => {
                        let total = supervisor.reconnects_total();
                        let exported = metrics.gateway_reconnects_total.get();
                        if total > exported {
                            metrics.gateway_reconnects_total.inc_by(total - exported);
                        }
                    }
                }
            }
        }
    });

    info!("All tasks spawned — bridge is running");

    // ── 11. Wait for SIGINT or SIGTERM ──────────────────────
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("SIGINT received, initiating graceful shutdown");
        }
    }

    // ── Graceful shutdown ───────────────────────────────────

    // 1. Readiness probe goes 503 first so load balancers drain.
    let _ = ready_tx.send(false);

    // 2. Stop the gateway session; the supervisor joins its thread.
    supervisor.disconnect();

    // 3. Broadcast shutdown to every task.
    let _ = shutdown_tx.send(());

    // 4. Bounded waits, slowest first.
    if let Some(handle) = supervisor_handle {
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), pipeline_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), health_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), control_plane_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), ops_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), reconnect_meter_handle).await;
    if let Some(handle) = metrics_handle {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    let _ = bus.flush().await;
    info!("Shutdown complete");
    Ok(())
}

/// Resolve the configured gateway connector.
///
/// `sim` is the in-tree connector; a vendor binding registers here.
fn build_session_factory(config: &config::AppConfig) -> Result<Arc<dyn SessionFactory>> {
    match config.service.connector.as_str() {
        "sim" => Ok(SimSessionFactory::new(SimGatewayConfig {
            symbols: config.gateway.symbols.clone(),
            tick_interval_ms: 500,
            fail_first_attempts: 0,
            reject_auth: false,
        })),
        other => anyhow::bail!("unknown gateway connector: {other}"),
    }
}
