//! Lifecycle state machine for mesh agents.

use thiserror::Error;
use tracing::debug;

use amcp_primitives::AgentId;

/// Discrete states an agent can occupy inside a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Registered but not receiving events.
    Inactive,
    /// Receiving and handling events.
    Active,
    /// A transfer is in flight; inbound events are buffered.
    Migrating,
    /// Terminal state; the agent left this context or was destroyed.
    Destroyed,
}

impl AgentState {
    /// Returns `true` when events may be delivered to the agent.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns `true` once the state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

/// Events that drive lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Begin delivering events.
    Activate,
    /// Stop delivering events while keeping subscriptions.
    Deactivate,
    /// Suspend delivery for an outbound transfer.
    BeginMigration,
    /// The transfer succeeded; the agent no longer lives here.
    CompleteMigration,
    /// The transfer failed; resume normal operation.
    RollBack,
    /// Tear the agent down permanently.
    Destroy,
}

/// Computes the successor state, or `None` when the event is not permitted.
#[must_use]
pub(crate) const fn next_state(from: AgentState, event: LifecycleEvent) -> Option<AgentState> {
    match (from, event) {
        (AgentState::Inactive, LifecycleEvent::Activate)
        | (AgentState::Migrating, LifecycleEvent::RollBack) => Some(AgentState::Active),
        (AgentState::Active, LifecycleEvent::Deactivate) => Some(AgentState::Inactive),
        (AgentState::Active, LifecycleEvent::BeginMigration) => Some(AgentState::Migrating),
        (AgentState::Migrating, LifecycleEvent::CompleteMigration)
        | (AgentState::Inactive | AgentState::Active, LifecycleEvent::Destroy) => {
            Some(AgentState::Destroyed)
        }
        _ => None,
    }
}

pub(crate) fn apply_transition(
    agent_id: &AgentId,
    from: AgentState,
    event: LifecycleEvent,
) -> Result<AgentState, LifecycleError> {
    let Some(next) = next_state(from, event) else {
        return Err(LifecycleError::InvalidTransition {
            agent_id: agent_id.clone(),
            from,
            event,
        });
    };
    if next != from {
        debug!(agent_id = %agent_id, ?from, ?next, ?event, "agent lifecycle transition");
    }
    Ok(next)
}

/// Errors emitted by the lifecycle state machine.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The event is not permitted from the current state. The state is left
    /// unchanged.
    #[error("invalid lifecycle transition from {from:?} via {event:?} for agent {agent_id}")]
    InvalidTransition {
        /// Identifier of the agent whose transition failed.
        agent_id: AgentId,
        /// State prior to the attempted transition.
        from: AgentState,
        /// Event that triggered the failure.
        event: LifecycleEvent,
    },
}
