//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) that the domain/usecases layer
//! requires from the outside world. Adapters implement these traits.
//!
//! Port categories:
//! - `gateway`: Blocking vendor session + factory + event union
//! - `message_bus`: Publish/subscribe + request/reply fabric
//! - `runtime`: Process/container lifecycle capability

pub mod gateway;
pub mod message_bus;
pub mod runtime;
