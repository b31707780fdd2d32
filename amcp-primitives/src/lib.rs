//! Core shared types for the AMCP agent mesh.

#![warn(missing_docs, clippy::pedantic)]

mod capability;
mod error;
mod ids;
mod topic;

/// Capability tag validated for use in topics and registry records.
pub use capability::CapabilityId;
/// Error type and result alias shared across the mesh runtime.
pub use error::{Error, Result};
/// Identifiers for agents and their hosting contexts.
pub use ids::{AgentId, ContextId};
/// Hierarchical topics and subscription patterns.
pub use topic::{Topic, TopicPattern};
