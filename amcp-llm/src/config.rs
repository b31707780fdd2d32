//! Connector configuration.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use crate::client::{LlmError, LlmResult};

/// Latency posture for the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PerformanceMode {
    /// Use configured timeouts as-is.
    #[default]
    Default,
    /// Trim timeouts to roughly 60% for latency-sensitive deployments.
    Optimized,
}

/// Configuration for [`LlmClient`](crate::LlmClient).
#[derive(Debug, Clone)]
pub struct LlmConfig {
    base_url: String,
    default_model: String,
    timeout_default: Duration,
    model_timeouts: Vec<(String, Duration)>,
    max_retries: u32,
    concurrency: NonZeroUsize,
    cache_enabled: bool,
    cache_memory_entries: NonZeroUsize,
    cache_ttl: Duration,
    cache_disk_path: Option<PathBuf>,
    performance_mode: PerformanceMode,
    mock_responses: bool,
    mock_reply: Option<String>,
}

impl LlmConfig {
    /// Creates a configuration for the supplied default model.
    #[must_use]
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_owned(),
            default_model: default_model.into(),
            timeout_default: Duration::from_secs(60),
            model_timeouts: Vec::new(),
            max_retries: 3,
            concurrency: NonZeroUsize::new(10).expect("non-zero"),
            cache_enabled: true,
            cache_memory_entries: NonZeroUsize::new(500).expect("non-zero"),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            cache_disk_path: None,
            performance_mode: PerformanceMode::Default,
            mock_responses: false,
            mock_reply: None,
        }
    }

    /// Overrides the endpoint base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the default request timeout for models without a table entry.
    #[must_use]
    pub const fn with_timeout_default(mut self, timeout: Duration) -> Self {
        self.timeout_default = timeout;
        self
    }

    /// Adds a per-model timeout keyed by model-name prefix.
    #[must_use]
    pub fn with_model_timeout(mut self, prefix: impl Into<String>, timeout: Duration) -> Self {
        self.model_timeouts.push((prefix.into(), timeout));
        self
    }

    /// Sets the retry budget for transport failures.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the concurrency gate width.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: NonZeroUsize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Enables or disables caching entirely.
    #[must_use]
    pub const fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Sets the in-memory cache capacity.
    #[must_use]
    pub const fn with_cache_memory_entries(mut self, entries: NonZeroUsize) -> Self {
        self.cache_memory_entries = entries;
        self
    }

    /// Sets the cache entry time-to-live.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Enables the durable disk tier at the given path.
    #[must_use]
    pub fn with_cache_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_disk_path = Some(path.into());
        self
    }

    /// Selects the performance mode.
    #[must_use]
    pub const fn with_performance_mode(mut self, mode: PerformanceMode) -> Self {
        self.performance_mode = mode;
        self
    }

    /// Enables mocked responses for offline testing.
    #[must_use]
    pub const fn with_mock_responses(mut self, enabled: bool) -> Self {
        self.mock_responses = enabled;
        self
    }

    /// Fixes the text mocked responses return (implies nothing unless
    /// mocking is enabled).
    #[must_use]
    pub fn with_mock_reply(mut self, reply: impl Into<String>) -> Self {
        self.mock_reply = Some(reply.into());
        self
    }

    /// Returns the endpoint base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the default model name.
    #[must_use]
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Returns the retry budget.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the concurrency gate width.
    #[must_use]
    pub const fn concurrency(&self) -> NonZeroUsize {
        self.concurrency
    }

    /// Returns whether caching is enabled.
    #[must_use]
    pub const fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    /// Returns the in-memory cache capacity.
    #[must_use]
    pub const fn cache_memory_entries(&self) -> NonZeroUsize {
        self.cache_memory_entries
    }

    /// Returns the cache entry time-to-live.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Returns the disk tier path, when configured.
    #[must_use]
    pub fn cache_disk_path(&self) -> Option<&PathBuf> {
        self.cache_disk_path.as_ref()
    }

    /// Returns whether mocked responses are enabled.
    #[must_use]
    pub const fn mock_responses(&self) -> bool {
        self.mock_responses
    }

    /// Returns the canned mock reply, when configured.
    #[must_use]
    pub fn mock_reply(&self) -> Option<&str> {
        self.mock_reply.as_deref()
    }

    /// Resolves the request timeout for a model: longest matching prefix in
    /// the table, or the default; optimized mode trims the result.
    #[must_use]
    pub fn timeout_for(&self, model: &str) -> Duration {
        let base = self
            .model_timeouts
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(self.timeout_default, |(_, timeout)| *timeout);
        match self.performance_mode {
            PerformanceMode::Default => base,
            PerformanceMode::Optimized => base.mul_f64(0.6),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Configuration`] when any value is inconsistent.
    pub fn validate(&self) -> LlmResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(LlmError::configuration("base url cannot be empty"));
        }
        if self.default_model.trim().is_empty() {
            return Err(LlmError::configuration("default model cannot be empty"));
        }
        if self.timeout_default.is_zero() {
            return Err(LlmError::configuration(
                "default timeout must be greater than zero",
            ));
        }
        if self.cache_enabled && self.cache_ttl.is_zero() {
            return Err(LlmError::configuration(
                "cache ttl must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let config = LlmConfig::new("gemma3")
            .with_timeout_default(Duration::from_secs(60))
            .with_model_timeout("qwen", Duration::from_secs(30))
            .with_model_timeout("qwen2:72b", Duration::from_secs(300));

        assert_eq!(config.timeout_for("qwen2:1.5b"), Duration::from_secs(30));
        assert_eq!(config.timeout_for("qwen2:72b"), Duration::from_secs(300));
        assert_eq!(config.timeout_for("mistral"), Duration::from_secs(60));
    }

    #[test]
    fn optimized_mode_trims_timeouts() {
        let config = LlmConfig::new("gemma3")
            .with_timeout_default(Duration::from_secs(100))
            .with_performance_mode(PerformanceMode::Optimized);
        assert_eq!(config.timeout_for("gemma3"), Duration::from_secs(60));
    }

    #[test]
    fn validation_rejects_empty_model() {
        assert!(LlmConfig::new("  ").validate().is_err());
        assert!(LlmConfig::new("gemma3").validate().is_ok());
    }
}
