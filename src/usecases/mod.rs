//! Use Cases Layer - Application Business Logic
//!
//! Orchestrates domain logic with port interfaces to implement the
//! bridge's core workflows. Each use case is a self-contained
//! long-running loop or command handler.
//!
//! Use cases:
//! - `IngestPipeline`: bridge consumer → translate → publish loop
//! - `ControlPlaneService`: subscription registry + bus responders
//! - `SubscriptionHealthEngine`: coverage reconciliation + remediation
//! - `FailoverOrchestrator`: lifecycle state machine with rollback
//! - `OpsService`: external request/response envelope

pub mod control_plane;
pub mod health_engine;
pub mod ingest;
pub mod ops;
pub mod orchestrator;

pub use control_plane::{ControlPlaneService, SubscriptionRegistry};
pub use health_engine::SubscriptionHealthEngine;
pub use ingest::IngestPipeline;
pub use ops::OpsService;
pub use orchestrator::{FailoverOrchestrator, OrchestratorState};
