//! Orchestration engine: LLM-backed planning, capability routing, and
//! response synthesis for the AMCP mesh.

#![warn(missing_docs, clippy::pedantic)]

mod orchestrator;
mod plan;
mod planner;

/// The orchestrator agent and its configuration.
pub use orchestrator::{
    OrchestratorAgent, OrchestratorConfig, ORCHESTRATION_REQUEST_TOPIC,
    ORCHESTRATION_RESPONSE_TOPIC,
};
/// Task plan model and validation.
pub use plan::{ErrorPolicy, PlanError, PlanResult, Priority, TaskItem, TaskPlan};
/// The planner.
pub use planner::{PlanOutcome, PlannerConfig, TaskPlanner};
