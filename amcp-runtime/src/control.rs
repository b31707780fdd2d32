//! Operational control commands delivered with priority over data events.

use amcp_primitives::ContextId;

use crate::lifecycle::AgentState;

/// Pre-defined operational commands a context can issue to one of its agents.
///
/// Control delivery bypasses the bus queues: the context invokes the command
/// directly, still serialized against the agent's in-flight data events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Liveness probe; answers with the current lifecycle state.
    Ping,
    /// Stop event delivery, keeping subscriptions for a later activation.
    Drain,
    /// Destroy the agent.
    Shutdown,
    /// Dispatch the agent to another context.
    Migrate {
        /// Transfer destination.
        destination: ContextId,
    },
}

/// Result of a control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Answer to [`ControlEvent::Ping`].
    Pong {
        /// Lifecycle state at the time of the probe.
        state: AgentState,
    },
    /// The agent was deactivated.
    Drained,
    /// The agent was destroyed.
    ShutDown,
    /// The agent was dispatched to the requested destination.
    Migrated {
        /// Transfer destination.
        destination: ContextId,
    },
}
