//! Asynchronous client for the local LLM endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::cache::{DiskCache, LlmCache, MemoryCache};
use crate::config::LlmConfig;
use crate::fallback::FallbackManager;

const LLM_SERVICE: &str = "llm";
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Result alias for connector operations.
pub type LlmResult<T> = Result<T, LlmError>;

/// Errors surfaced by the connector.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The connector is misconfigured.
    #[error("llm connector misconfigured: {reason}")]
    Configuration {
        /// Human-readable reason.
        reason: String,
    },

    /// Retries and the fallback manager are both exhausted.
    #[error("llm unavailable: {reason}")]
    Unavailable {
        /// Human-readable reason.
        reason: String,
    },

    /// The endpoint answered with something other than the expected shape.
    #[error("llm returned malformed output: {reason}")]
    MalformedOutput {
        /// Human-readable reason.
        reason: String,
    },

    /// The downstream circuit is open and no fallback rule matched.
    #[error("circuit open for downstream `{service}`")]
    CircuitOpen {
        /// Downstream service name.
        service: String,
    },

    /// The connector is shutting down.
    #[error("llm connector is shut down")]
    Shutdown,
}

impl LlmError {
    /// Convenience constructor for configuration errors.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }
}

/// Sampling and resource parameters forwarded to the endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Output token budget.
    pub max_tokens: Option<u32>,
    /// Nucleus sampling threshold.
    pub top_p: Option<f32>,
    /// GPU layer hint.
    pub num_gpu: Option<u32>,
    /// CPU thread hint.
    pub num_thread: Option<u32>,
}

impl GenerationParams {
    /// Stable fragment folded into the cache key. Resource hints are
    /// excluded: they change where the model runs, not what it answers.
    fn cache_fragment(&self) -> String {
        let mut pairs: BTreeMap<&str, String> = BTreeMap::new();
        if let Some(temperature) = self.temperature {
            pairs.insert("temperature", temperature.to_string());
        }
        if let Some(max_tokens) = self.max_tokens {
            pairs.insert("max_tokens", max_tokens.to_string());
        }
        if let Some(top_p) = self.top_p {
            pairs.insert("top_p", top_p.to_string());
        }
        pairs
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Where a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Fresh endpoint response.
    Live,
    /// Cache hit (memory or disk tier).
    Cache,
    /// Rule-based emergency response.
    Fallback,
}

/// A connector reply with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmReply {
    text: String,
    source: ResponseSource,
}

impl LlmReply {
    /// Returns the response text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns the reply provenance.
    #[must_use]
    pub const fn source(&self) -> ResponseSource {
        self.source
    }

    /// Returns `true` when the reply is a degraded (fallback) answer.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        matches!(self.source, ResponseSource::Fallback)
    }

    /// Consumes the reply, returning the text.
    #[must_use]
    pub fn into_text(self) -> String {
        self.text
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
    fallbacks_used: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
}

/// Point-in-time connector statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LlmStats {
    /// Total `generate` invocations.
    pub total_requests: u64,
    /// Requests served from cache.
    pub cache_hits: u64,
    /// Requests that exhausted their retry budget.
    pub failures: u64,
    /// Requests answered by the fallback manager.
    pub fallbacks_used: u64,
    /// Mean live-request latency in milliseconds.
    pub average_latency_ms: u64,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_gpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_thread: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Rate-limited, cached, self-degrading LLM client.
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
    semaphore: Arc<Semaphore>,
    cache: Option<LlmCache>,
    fallback: Arc<FallbackManager>,
    stats: StatsInner,
}

impl LlmClient {
    /// Creates a client from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Configuration`] when the configuration or the
    /// HTTP client cannot be materialized.
    pub fn new(config: LlmConfig, fallback: Arc<FallbackManager>) -> LlmResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| LlmError::configuration(format!("http client: {err}")))?;

        let cache = if config.cache_enabled() {
            let memory = MemoryCache::new(config.cache_memory_entries(), config.cache_ttl());
            let disk = config
                .cache_disk_path()
                .map(|path| DiskCache::new(path, config.cache_ttl()));
            Some(LlmCache::new(memory, disk))
        } else {
            None
        };

        Ok(Self {
            http,
            semaphore: Arc::new(Semaphore::new(config.concurrency().get())),
            cache,
            config,
            fallback,
            stats: StatsInner::default(),
        })
    }

    /// Returns the fallback manager used by this client.
    #[must_use]
    pub fn fallback(&self) -> &Arc<FallbackManager> {
        &self.fallback
    }

    /// Generates a completion for the prompt.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Unavailable`] when retries and fallback rules are
    /// exhausted, or [`LlmError::CircuitOpen`] when the circuit is open and
    /// no rule matched.
    pub async fn generate(
        &self,
        prompt: &str,
        model: Option<&str>,
        params: &GenerationParams,
    ) -> LlmResult<LlmReply> {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        let model = model.unwrap_or_else(|| self.config.default_model());
        let key = cache_key(model, prompt, params);

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&key).await {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(model, "llm cache hit");
                return Ok(LlmReply {
                    text: hit,
                    source: ResponseSource::Cache,
                });
            }
        }

        if !self.fallback.breaker().allow(LLM_SERVICE) {
            return self
                .degraded_reply(prompt, "circuit open")
                .ok_or(LlmError::CircuitOpen {
                    service: LLM_SERVICE.to_owned(),
                });
        }

        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| LlmError::Shutdown)?;

        match self.request_with_retries(model, prompt, params).await {
            Ok(text) => {
                if let Some(cache) = &self.cache {
                    cache.put(&key, &text).await;
                }
                self.fallback.learn(prompt, &text);
                self.fallback.breaker().record_success(LLM_SERVICE);
                Ok(LlmReply {
                    text,
                    source: ResponseSource::Live,
                })
            }
            Err(reason) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                self.fallback.breaker().record_failure(LLM_SERVICE);
                warn!(model, reason, "llm request exhausted retries");
                self.degraded_reply(prompt, &reason)
                    .ok_or(LlmError::Unavailable { reason })
            }
        }
    }

    fn degraded_reply(&self, prompt: &str, reason: &str) -> Option<LlmReply> {
        let text = self.fallback.emergency_response(prompt, reason)?;
        self.stats.fallbacks_used.fetch_add(1, Ordering::Relaxed);
        Some(LlmReply {
            text,
            source: ResponseSource::Fallback,
        })
    }

    async fn request_with_retries(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, String> {
        if self.config.mock_responses() {
            if let Some(reply) = self.config.mock_reply() {
                return Ok(reply.to_owned());
            }
            let first_line = prompt.lines().next().unwrap_or_default();
            return Ok(format!("[mock:{model}] {first_line}"));
        }

        let deadline = self.config.timeout_for(model);
        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let failure = match timeout(deadline, self.request_once(model, prompt, params)).await {
                Ok(Ok(text)) => {
                    let elapsed =
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    self.stats
                        .latency_total_ms
                        .fetch_add(elapsed, Ordering::Relaxed);
                    self.stats.latency_samples.fetch_add(1, Ordering::Relaxed);
                    return Ok(text);
                }
                Ok(Err(reason)) => reason,
                Err(_) => format!("request timed out after {deadline:?}"),
            };
            if attempt >= self.config.max_retries() {
                return Err(failure);
            }
            debug!(model, attempt, reason = %failure, "llm attempt failed; backing off");
            sleep(backoff_delay(attempt)).await;
            attempt += 1;
        }
    }

    async fn request_once(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, String> {
        let options = if params.num_gpu.is_some() || params.num_thread.is_some() {
            Some(GenerateOptions {
                num_gpu: params.num_gpu,
                num_thread: params.num_thread,
            })
        } else {
            None
        };
        let body = GenerateRequest {
            model,
            prompt,
            stream: false,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            options,
        };

        let url = format!("{}/api/generate", self.config.base_url().trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| format!("transport: {err}"))?;

        if !response.status().is_success() {
            return Err(format!("endpoint returned {}", response.status()));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|err| format!("malformed response body: {err}"))?;
        if let Some(error) = parsed.error {
            return Err(format!("endpoint error: {error}"));
        }
        parsed
            .response
            .ok_or_else(|| "response field missing".to_owned())
    }

    /// Returns a snapshot of connector statistics.
    #[must_use]
    pub fn stats(&self) -> LlmStats {
        let samples = self.stats.latency_samples.load(Ordering::Relaxed);
        let total = self.stats.latency_total_ms.load(Ordering::Relaxed);
        LlmStats {
            total_requests: self.stats.total_requests.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            fallbacks_used: self.stats.fallbacks_used.load(Ordering::Relaxed),
            average_latency_ms: if samples == 0 { 0 } else { total / samples },
        }
    }

    /// Runs cache maintenance (expired-entry purge, disk compaction).
    pub async fn maintain_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.purge_expired().await;
        }
    }

    /// Drains in-flight requests within the timeout, then refuses new work.
    ///
    /// Returns `true` when the drain completed inside the budget.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        let permits = u32::try_from(self.config.concurrency().get()).unwrap_or(u32::MAX);
        let drained = timeout(
            drain_timeout,
            Arc::clone(&self.semaphore).acquire_many_owned(permits),
        )
        .await;
        self.semaphore.close();
        match drained {
            Ok(Ok(_permits)) => {
                info!("llm connector drained");
                true
            }
            _ => {
                warn!("llm connector shutdown timed out with requests in flight");
                false
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt)).min(BACKOFF_CAP)
}

fn normalize_prompt(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cache_key(model: &str, prompt: &str, params: &GenerationParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize_prompt(prompt).as_bytes());
    hasher.update(b"\n");
    hasher.update(params.cache_fragment().as_bytes());
    let digest = hasher.finalize();
    let mut key = String::with_capacity(digest.len() * 2);
    for byte in digest {
        key.push_str(&format!("{byte:02x}"));
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;

    fn mock_client() -> LlmClient {
        let config = LlmConfig::new("gemma3").with_mock_responses(true);
        LlmClient::new(config, Arc::new(FallbackManager::default())).unwrap()
    }

    fn unreachable_client() -> LlmClient {
        let config = LlmConfig::new("gemma3")
            .with_base_url("http://127.0.0.1:9")
            .with_max_retries(0)
            .with_timeout_default(Duration::from_secs(2));
        LlmClient::new(config, Arc::new(FallbackManager::default())).unwrap()
    }

    #[test]
    fn cache_key_is_stable_and_normalized() {
        let params = GenerationParams::default();
        let a = cache_key("m", "hello   world", &params);
        let b = cache_key("m", "hello world", &params);
        let c = cache_key("m", "hello mars", &params);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(cache_key("other", "hello world", &params), a);
    }

    #[test]
    fn cache_key_reflects_sampling_params_only() {
        let base = GenerationParams::default();
        let sampled = GenerationParams {
            temperature: Some(0.2),
            ..GenerationParams::default()
        };
        let hinted = GenerationParams {
            num_gpu: Some(2),
            ..GenerationParams::default()
        };
        assert_ne!(cache_key("m", "p", &base), cache_key("m", "p", &sampled));
        assert_eq!(cache_key("m", "p", &base), cache_key("m", "p", &hinted));
    }

    #[tokio::test]
    async fn mock_generation_caches_second_call() {
        let client = mock_client();
        let params = GenerationParams::default();

        let first = client.generate("ping", None, &params).await.unwrap();
        assert_eq!(first.source(), ResponseSource::Live);

        let second = client.generate("ping", None, &params).await.unwrap();
        assert_eq!(second.source(), ResponseSource::Cache);
        assert_eq!(first.text(), second.text());

        let stats = client.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.cache_hits, 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_degrades_to_fallback() {
        let client = unreachable_client();
        let reply = client
            .generate("how to sort a list in code", None, &GenerationParams::default())
            .await
            .unwrap();
        assert!(reply.is_degraded());
        assert!(reply.text().contains("how to sort a list in code"));

        let stats = client.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.fallbacks_used, 1);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_requests() {
        let client = mock_client();
        assert!(client.shutdown(Duration::from_millis(100)).await);
        let err = client
            .generate("ping", None, &GenerationParams::default())
            .await
            .expect_err("closed");
        assert!(matches!(err, LlmError::Shutdown));
    }

    #[tokio::test]
    async fn stats_track_latency_samples() {
        let client = mock_client();
        client
            .generate("one", None, &GenerationParams::default())
            .await
            .unwrap();
        let stats = client.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn concurrency_gate_matches_config() {
        let config = LlmConfig::new("gemma3")
            .with_concurrency(NonZeroUsize::new(2).unwrap())
            .with_mock_responses(true);
        let client = LlmClient::new(config, Arc::new(FallbackManager::default())).unwrap();
        assert_eq!(client.semaphore.available_permits(), 2);
    }
}
