//! Agent runtime for the AMCP mesh.
//!
//! A context hosts a set of agents inside one process, routes bus events to
//! them with per-agent serialization, drives their lifecycle state machine,
//! and moves them between contexts through the mobility subsystem.

#![warn(missing_docs, clippy::pedantic)]

mod agent;
mod config;
mod context;
mod control;
mod lifecycle;
mod mobility;
mod registry;

/// Agent trait family, factories, and the per-agent service handle.
pub use agent::{
    Agent, AgentError, AgentFactory, AgentFactoryRegistry, AgentResult, AgentServices,
    EventReactor, LifecycleHooks, Mobile, Persistable,
};
/// Runtime configuration aggregates.
pub use config::{BrokerKind, MobilityConfig, RuntimeConfig};
/// The agent context and its error type.
pub use context::{AgentContext, RuntimeError, RuntimeResult};
/// Operational control commands.
pub use control::{ControlEvent, ControlOutcome};
/// Lifecycle state machine types.
pub use lifecycle::{AgentState, LifecycleError, LifecycleEvent};
/// Mobility verbs, tickets, and errors.
pub use mobility::{
    MigrationMode, MigrationTicket, MobilityError, MobilityManager, MobilityResult,
    AGENT_MIGRATED_TOPIC, MOBILITY_COMPLETED_TOPIC, MOBILITY_FAILED_TOPIC,
};
/// Capability directory agent and its wire types.
pub use registry::{
    CapabilityRecord, HealthStatus, QueryRequest, QueryResponse, RegistrationAnnouncement,
    RegistryAgent, RegistryConfig, heartbeat_event, query_request_event, registration_event,
    REGISTRY_DEREGISTER_TOPIC, REGISTRY_HEARTBEAT_TOPIC, REGISTRY_QUERY_REQUEST_TOPIC,
    REGISTRY_QUERY_RESPONSE_TOPIC, REGISTRY_REGISTER_TOPIC,
};
