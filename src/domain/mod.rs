//! Domain layer - Core models and pure evaluation logic.
//!
//! No I/O and no external services here (hexagonal architecture inner
//! ring). All types are serializable and testable in isolation.

pub mod health;
pub mod runbook;
pub mod tick;

// Re-export core types for convenience
pub use health::{
    evaluate_health, HealthMode, HealthReport, HealthThresholds, StallSeverity,
    StalledContract, SubscriptionEntry,
};
pub use runbook::{
    ExecutionEnvelope, ProfileName, RunbookCommand, RunbookExecution, RunbookHistory,
    RunbookRequest,
};
pub use tick::{DomainTick, Exchange, SerializationStrategy, TickError};
