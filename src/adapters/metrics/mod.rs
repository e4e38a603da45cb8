//! Metrics Adapters - Prometheus Export and Probes
//!
//! One registry instance is shared by every component; the exporter
//! also serves the /live and /ready probes used by the orchestrator's
//! runtime checks.

pub mod prometheus;

pub use prometheus::MetricsRegistry;
