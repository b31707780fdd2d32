//! The agent trait family and type factories.
//!
//! The four capabilities an agent may exhibit are split into explicit traits
//! and composed by [`Agent`]: reacting to events, lifecycle hooks, mobility
//! hooks, and serializable state. Hooks default to no-ops so simple agents
//! only implement what they use.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use amcp_bus::BusError;
use amcp_events::{Event, EventError};
use amcp_primitives::{ContextId, TopicPattern};

pub use crate::context::AgentServices;

/// Result alias for agent-authored code.
pub type AgentResult<T = ()> = Result<T, AgentError>;

/// Errors agent implementations may surface to the runtime.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The event handler failed.
    #[error("agent handler error: {reason}")]
    Handler {
        /// Human-readable reason.
        reason: String,
    },

    /// State capture failed during migration.
    #[error("state capture failed: {reason}")]
    Capture {
        /// Human-readable reason.
        reason: String,
    },

    /// State restore failed during migration.
    #[error("state restore failed: {reason}")]
    Restore {
        /// Human-readable reason.
        reason: String,
    },

    /// A bus operation issued through [`AgentServices`] failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Envelope construction failed.
    #[error(transparent)]
    Envelope(#[from] EventError),

    /// The owning context or agent cell has gone away.
    #[error("agent is detached from its context")]
    Detached,
}

impl AgentError {
    /// Convenience constructor for handler failures.
    #[must_use]
    pub fn handler(reason: impl Into<String>) -> Self {
        Self::Handler {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for capture failures.
    #[must_use]
    pub fn capture(reason: impl Into<String>) -> Self {
        Self::Capture {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for restore failures.
    #[must_use]
    pub fn restore(reason: impl Into<String>) -> Self {
        Self::Restore {
            reason: reason.into(),
        }
    }
}

/// Reaction to events delivered through the owning context.
#[async_trait]
pub trait EventReactor: Send + Sync {
    /// Handles one event. Invocations are serialized per agent; the agent may
    /// treat its own state as single-threaded.
    async fn on_event(&self, services: &AgentServices, event: Event) -> AgentResult;
}

/// Lifecycle hooks invoked by the context around state transitions.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Runs after the agent transitions to ACTIVE.
    async fn on_activate(&self, services: &AgentServices) -> AgentResult {
        let _ = services;
        Ok(())
    }

    /// Runs after the agent transitions to INACTIVE.
    async fn on_deactivate(&self, services: &AgentServices) -> AgentResult {
        let _ = services;
        Ok(())
    }

    /// Runs before the agent is removed for good.
    async fn on_destroy(&self, services: &AgentServices) -> AgentResult {
        let _ = services;
        Ok(())
    }
}

/// Hooks invoked around strong migration.
#[async_trait]
pub trait Mobile: Send + Sync {
    /// Runs at the source while the agent is MIGRATING, before state capture.
    async fn on_before_migration(
        &self,
        services: &AgentServices,
        destination: &ContextId,
    ) -> AgentResult {
        let _ = (services, destination);
        Ok(())
    }

    /// Runs at the destination after subscriptions are re-bound.
    async fn on_after_migration(
        &self,
        services: &AgentServices,
        source: &ContextId,
    ) -> AgentResult {
        let _ = (services, source);
        Ok(())
    }
}

/// Serializable user state carried across migrations.
///
/// Agents declare their persistent state explicitly; the runtime treats the
/// captured value as opaque.
pub trait Persistable: Send + Sync {
    /// Captures the agent's persistent state.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Capture`] when the state cannot be serialized.
    fn capture_state(&self) -> AgentResult<Value> {
        Ok(Value::Null)
    }

    /// Restores previously captured state.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Restore`] when the value cannot be applied.
    fn restore_state(&self, state: Value) -> AgentResult {
        let _ = state;
        Ok(())
    }
}

/// A complete mesh agent.
pub trait Agent: EventReactor + LifecycleHooks + Mobile + Persistable {
    /// Type tag used by factories to re-instantiate the agent after a
    /// migration.
    fn agent_type(&self) -> &str;

    /// Topic patterns the agent wants delivered. Bound on activation and
    /// re-bound after migration.
    fn subscriptions(&self) -> Vec<TopicPattern>;
}

/// Creates fresh agent instances for a given type tag.
pub trait AgentFactory: Send + Sync {
    /// Builds an agent in its pristine state; the runtime restores captured
    /// state afterwards.
    fn create(&self) -> Arc<dyn Agent>;
}

impl<F> AgentFactory for F
where
    F: Fn() -> Arc<dyn Agent> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Agent> {
        self()
    }
}

/// Explicit `agent type → factory` registry wired at startup.
///
/// Mobility tickets carry the type tag; the receiving context looks the
/// factory up here instead of relying on reflection.
#[derive(Default)]
pub struct AgentFactoryRegistry {
    factories: RwLock<HashMap<String, Arc<dyn AgentFactory>>>,
}

impl AgentFactoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for a type tag, replacing any previous entry.
    pub fn register(&self, agent_type: impl Into<String>, factory: Arc<dyn AgentFactory>) {
        self.factories
            .write()
            .expect("factory registry lock poisoned")
            .insert(agent_type.into(), factory);
    }

    /// Looks up the factory for a type tag.
    #[must_use]
    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn AgentFactory>> {
        self.factories
            .read()
            .expect("factory registry lock poisoned")
            .get(agent_type)
            .cloned()
    }

    /// Returns the registered type tags.
    #[must_use]
    pub fn known_types(&self) -> Vec<String> {
        self.factories
            .read()
            .expect("factory registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
