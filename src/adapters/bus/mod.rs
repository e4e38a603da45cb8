//! Message Bus Adapters
//!
//! - `nats`: production fabric over async-nats
//! - `memory`: in-process fabric for mock mode and tests

pub mod memory;
pub mod nats;

pub use memory::InProcessBus;
pub use nats::NatsBus;
