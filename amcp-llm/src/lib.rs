//! Asynchronous LLM connector for the AMCP orchestration layer.
//!
//! Requests flow through a bounded concurrency gate, a two-tier response
//! cache, and per-model timeouts; sustained failure trips a circuit breaker
//! and degrades to learnt rule-based responses instead of erroring out.

#![warn(missing_docs, clippy::pedantic)]

mod cache;
mod client;
mod config;
mod fallback;

/// Two-tier response cache.
pub use cache::{CacheError, CacheResult, DiskCache, LlmCache, MemoryCache};
/// The connector itself.
pub use client::{
    GenerationParams, LlmClient, LlmError, LlmReply, LlmResult, LlmStats, ResponseSource,
};
/// Connector configuration.
pub use config::{LlmConfig, PerformanceMode};
/// Degradation machinery: repair, learnt rules, circuit breaking.
pub use fallback::{BreakerConfig, CircuitBreaker, FallbackManager, FallbackRule};
