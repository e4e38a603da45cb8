//! Gateway Adapters - Session Supervision and Connectors
//!
//! - `supervisor`: reconnect/backoff state machine hosting one blocking
//!   session per dedicated OS thread
//! - `sim`: deterministic in-tree connector for mock mode and drills

pub mod sim;
pub mod supervisor;

pub use sim::{SimGatewayConfig, SimSessionFactory};
pub use supervisor::{ConnectionState, GatewaySupervisor, RetryPolicy};
