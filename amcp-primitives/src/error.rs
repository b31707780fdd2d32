//! Shared error definitions for mesh primitives.

use thiserror::Error;

/// Result alias used throughout the mesh primitives.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while manipulating mesh primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// Agent identifier failed validation.
    #[error("invalid agent id: {reason}")]
    InvalidAgentId {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Context identifier failed validation.
    #[error("invalid context id `{id}`: {reason}")]
    InvalidContextId {
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Capability tag failed validation.
    #[error("invalid capability `{id}`: {reason}")]
    InvalidCapability {
        /// The offending tag string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Concrete topic failed validation.
    #[error("invalid topic `{topic}`: {reason}")]
    InvalidTopic {
        /// The offending topic string.
        topic: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Subscription pattern failed validation.
    #[error("invalid topic pattern `{pattern}`: {reason}")]
    InvalidPattern {
        /// The offending pattern string.
        pattern: String,
        /// Human-readable reason for rejection.
        reason: String,
    },
}
