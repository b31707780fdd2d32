//! Hierarchical publish/subscribe bus for the AMCP agent mesh.
//!
//! The broker abstraction is pluggable; the crate ships the in-memory
//! reference implementation used by single-process meshes and tests. Remote
//! brokers (Kafka, NATS, Solace) plug in behind the same [`EventBroker`]
//! trait.

#![warn(missing_docs, clippy::pedantic)]

mod broker;
mod correlation;
mod memory;
mod metrics;

/// Broker contract, scoped handles, and handler plumbing.
pub use broker::{
    BusError, BusResult, EventBroker, EventPublisher, EventSubscriber, HandlerError,
    HandlerResult, EventHandler, handler_fn,
};
/// Request/response correlation tracking over the bus.
pub use correlation::{
    CorrelationError, CorrelationResult, CorrelationTracker, PendingResponse,
};
/// In-memory reference broker.
pub use memory::{BrokerConfig, InMemoryBroker};
/// Delivery counters exposed by brokers.
pub use metrics::BrokerMetricsSnapshot;

/// Reserved topic carrying events that exhausted their delivery budget.
pub const DEADLETTER_TOPIC: &str = "system.deadletter";
