//! AMCP: a distributed mobile-agent mesh with LLM-assisted orchestration.
//!
//! Depend on this crate via `cargo add amcp`. It bundles the runtime crates
//! behind feature flags so deployments can drop the layers they do not use
//! (e.g. a pure pub/sub node needs neither the orchestrator nor the LLM
//! connector).

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use amcp_primitives as primitives;

/// CloudEvents-compatible envelopes (enabled by `events` feature).
#[cfg(feature = "events")]
pub use amcp_events as events;

/// Event bus and correlation tracking (enabled by `bus` feature).
#[cfg(feature = "bus")]
pub use amcp_bus as bus;

/// Agent contexts, lifecycle, mobility, registry (enabled by `runtime`
/// feature).
#[cfg(feature = "runtime")]
pub use amcp_runtime as runtime;

/// Prompt template library (enabled by `prompts` feature).
#[cfg(feature = "prompts")]
pub use amcp_prompts as prompts;

/// LLM connector, cache, fallback (enabled by `llm` feature).
#[cfg(feature = "llm")]
pub use amcp_llm as llm;

/// Planning and orchestration (enabled by `orchestrator` feature).
#[cfg(feature = "orchestrator")]
pub use amcp_orchestrator as orchestrator;

/// External A2A protocol bridge (enabled by `a2a` feature).
#[cfg(feature = "a2a")]
pub use amcp_a2a as a2a;
