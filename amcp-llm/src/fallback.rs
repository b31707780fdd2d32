//! Rule-based degradation: malformed-output repair, learnt emergency
//! responses, and per-downstream circuit breaking.

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::{LlmError, LlmResult};

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    failure_threshold: u32,
    cooldown: Duration,
}

impl BreakerConfig {
    /// Sets the consecutive-failure count that opens the circuit.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the cooldown before a half-open probe is allowed.
    #[must_use]
    pub const fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Configuration`] when values are inconsistent.
    pub fn validate(self) -> LlmResult<()> {
        if self.failure_threshold == 0 {
            return Err(LlmError::configuration(
                "failure threshold must be greater than zero",
            ));
        }
        if self.cooldown.is_zero() {
            return Err(LlmError::configuration(
                "cooldown must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { failures: u32 },
    Open { since: tokio::time::Instant },
    HalfOpen,
}

/// Per-downstream circuit breaker.
///
/// CLOSED → (threshold consecutive failures) OPEN → (cooldown) HALF-OPEN →
/// (success) CLOSED / (failure) OPEN.
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: StdMutex<HashMap<String, BreakerState>>,
}

impl CircuitBreaker {
    /// Creates a breaker with the supplied tuning.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: StdMutex::new(HashMap::new()),
        }
    }

    /// Returns whether a call to the service may proceed. An OPEN circuit
    /// past its cooldown transitions to HALF-OPEN and admits one probe.
    pub fn allow(&self, service: &str) -> bool {
        let mut states = self.states.lock().expect("breaker lock poisoned");
        let state = states
            .entry(service.to_owned())
            .or_insert(BreakerState::Closed { failures: 0 });
        match *state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= self.config.cooldown {
                    debug!(service, "circuit half-open; admitting probe");
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful call, closing the circuit.
    pub fn record_success(&self, service: &str) {
        let mut states = self.states.lock().expect("breaker lock poisoned");
        states.insert(service.to_owned(), BreakerState::Closed { failures: 0 });
    }

    /// Records a failed call; trips the circuit at the threshold.
    pub fn record_failure(&self, service: &str) {
        let mut states = self.states.lock().expect("breaker lock poisoned");
        let state = states
            .entry(service.to_owned())
            .or_insert(BreakerState::Closed { failures: 0 });
        *state = match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    warn!(service, failures, "circuit opened");
                    BreakerState::Open {
                        since: tokio::time::Instant::now(),
                    }
                } else {
                    BreakerState::Closed { failures }
                }
            }
            BreakerState::HalfOpen | BreakerState::Open { .. } => {
                warn!(service, "probe failed; circuit re-opened");
                BreakerState::Open {
                    since: tokio::time::Instant::now(),
                }
            }
        };
    }

    /// Returns whether the circuit is currently open (cooldown not yet
    /// elapsed).
    #[must_use]
    pub fn is_open(&self, service: &str) -> bool {
        let states = self.states.lock().expect("breaker lock poisoned");
        matches!(states.get(service), Some(BreakerState::Open { since }) if since.elapsed() < self.config.cooldown)
    }
}

/// A learnt emergency-response rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackRule {
    /// Keyword category the rule belongs to.
    pub category: String,
    /// Keywords that trigger the rule.
    pub keywords: Vec<String>,
    /// Response template; `{query}` is substituted at render time.
    pub template: String,
    /// Count of successful reuses.
    pub learning_score: u32,
    /// Timestamp of the last reuse.
    pub last_used: Option<DateTime<Utc>>,
    /// Quality score of the current template (length/diversity heuristic).
    pub quality: f64,
    /// Seeded rules survive pruning.
    pub seeded: bool,
}

fn seed_rules() -> HashMap<String, FallbackRule> {
    let seeds = [
        (
            "coding",
            vec!["code", "function", "sort", "debug", "compile", "program"],
            "The language model is unavailable right now. For \"{query}\": break the problem into \
             small functions, write one failing test first, and check the standard library before \
             writing new code.",
        ),
        (
            "help",
            vec!["help", "how do i", "guide", "assist"],
            "The assistant is temporarily degraded. Regarding \"{query}\": consult the project \
             documentation, and retry this request in a few minutes for a full answer.",
        ),
        (
            "question",
            vec!["what", "why", "when", "where", "who", "?"],
            "A full answer to \"{query}\" is not available while the language model is offline. \
             Please retry shortly.",
        ),
        (
            "chat",
            vec!["hello", "hi", "thanks", "thank you", "bye"],
            "Hello! The conversational model is briefly unavailable, but your request \
             (\"{query}\") has been noted. Please try again in a moment.",
        ),
        (
            "general",
            Vec::new(),
            "The request \"{query}\" could not be processed because the language model is \
             unreachable. The system will recover automatically.",
        ),
    ];
    seeds
        .into_iter()
        .map(|(category, keywords, template)| {
            (
                category.to_owned(),
                FallbackRule {
                    category: category.to_owned(),
                    keywords: keywords.into_iter().map(str::to_owned).collect(),
                    template: template.to_owned(),
                    learning_score: 0,
                    last_used: None,
                    quality: response_quality(template),
                    seeded: true,
                },
            )
        })
        .collect()
}

/// Length + vocabulary-diversity heuristic used to compare candidate
/// templates.
fn response_quality(response: &str) -> f64 {
    let words: Vec<&str> = response.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let unique: std::collections::HashSet<&str> = words.iter().copied().collect();
    #[allow(clippy::cast_precision_loss)]
    let diversity = unique.len() as f64 / words.len() as f64;
    #[allow(clippy::cast_precision_loss)]
    let length = (words.len().min(400)) as f64;
    length * diversity
}

const QUALITY_IMPROVEMENT_FACTOR: f64 = 1.2;

/// Repair, emergency responses, and rule learning.
pub struct FallbackManager {
    rules: StdRwLock<HashMap<String, FallbackRule>>,
    breaker: CircuitBreaker,
}

impl FallbackManager {
    /// Creates a manager seeded with the default category rules.
    #[must_use]
    pub fn new(breaker_config: BreakerConfig) -> Self {
        Self {
            rules: StdRwLock::new(seed_rules()),
            breaker: CircuitBreaker::new(breaker_config),
        }
    }

    /// Returns the circuit breaker shared with callers.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Classifies a prompt into a keyword category.
    #[must_use]
    pub fn classify(&self, prompt: &str) -> String {
        let lowered = prompt.to_lowercase();
        let rules = self.rules.read().expect("fallback rules lock poisoned");
        let mut best: Option<(&str, usize)> = None;
        for rule in rules.values() {
            let hits = rule
                .keywords
                .iter()
                .filter(|keyword| lowered.contains(keyword.as_str()))
                .count();
            if hits > 0 && best.is_none_or(|(_, best_hits)| hits > best_hits) {
                best = Some((&rule.category, hits));
            }
        }
        best.map_or_else(|| "general".to_owned(), |(category, _)| category.to_owned())
    }

    /// Attempts to repair a suspect JSON string: code-fence stripping,
    /// trailing-comma removal, and bracket balancing for truncated output.
    ///
    /// Returns the repaired string only if it parses afterwards.
    #[must_use]
    pub fn repair_json(&self, suspect: &str) -> Option<String> {
        let mut candidate = strip_code_fences(suspect).trim().to_owned();
        if let Some(start) = candidate.find(['{', '[']) {
            candidate = candidate[start..].to_owned();
        }
        candidate = remove_trailing_commas(&candidate);
        candidate = balance_brackets(&candidate);

        match serde_json::from_str::<serde_json::Value>(&candidate) {
            Ok(_) => {
                debug!("malformed output repaired");
                Some(candidate)
            }
            Err(err) => {
                debug!(error = %err, "output repair failed");
                None
            }
        }
    }

    /// Produces the best-matching emergency response for a failed request.
    #[must_use]
    pub fn emergency_response(&self, query: &str, failure_reason: &str) -> Option<String> {
        let category = self.classify(query);
        let mut rules = self.rules.write().expect("fallback rules lock poisoned");

        // Highest learning score wins among category matches, then most
        // recently used.
        let chosen = rules
            .values_mut()
            .filter(|rule| rule.category == category || rule.category == "general")
            .max_by(|a, b| {
                a.learning_score
                    .cmp(&b.learning_score)
                    .then_with(|| a.last_used.cmp(&b.last_used))
            })?;

        chosen.learning_score += 1;
        chosen.last_used = Some(Utc::now());
        info!(
            category = chosen.category,
            reason = failure_reason,
            "emergency response used"
        );
        Some(chosen.template.replace("{query}", query))
    }

    /// Learns from a successful live response: the category template is
    /// replaced when the new response scores notably higher.
    pub fn learn(&self, prompt: &str, response: &str) {
        let category = self.classify(prompt);
        let quality = response_quality(response);
        let mut rules = self.rules.write().expect("fallback rules lock poisoned");
        let Some(rule) = rules.get_mut(&category) else {
            return;
        };
        if quality > rule.quality * QUALITY_IMPROVEMENT_FACTOR {
            debug!(category, quality, "fallback template upgraded");
            rule.template = response.to_owned();
            rule.quality = quality;
            rule.seeded = false;
        }
    }

    /// Removes learnt rules unused beyond the retention window; seeded rules
    /// survive.
    pub fn prune(&self, retention: Duration) {
        let now = Utc::now();
        let mut rules = self.rules.write().expect("fallback rules lock poisoned");
        rules.retain(|_, rule| {
            if rule.seeded {
                return true;
            }
            let stale = rule.last_used.is_none_or(|used| {
                now.signed_duration_since(used)
                    .to_std()
                    .is_ok_and(|age| age > retention)
            });
            !stale
        });
    }

    /// Returns a snapshot of the current rules (for inspection and tests).
    #[must_use]
    pub fn rules(&self) -> Vec<FallbackRule> {
        self.rules
            .read()
            .expect("fallback rules lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl Default for FallbackManager {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

fn strip_code_fences(input: &str) -> &str {
    let trimmed = input.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip an optional language tag on the fence line.
    let body = body.split_once('\n').map_or(body, |(_, rest)| rest);
    body.strip_suffix("```").unwrap_or(body)
}

fn remove_trailing_commas(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = input.chars().collect();
    for (index, &ch) in chars.iter().enumerate() {
        if in_string {
            output.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                output.push(ch);
            }
            ',' => {
                let next = chars[index + 1..]
                    .iter()
                    .find(|candidate| !candidate.is_whitespace());
                if matches!(next, Some('}' | ']')) {
                    continue; // drop the trailing comma
                }
                output.push(ch);
            }
            _ => output.push(ch),
        }
    }
    output
}

fn balance_brackets(input: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut output = input.to_owned();
    if in_string {
        output.push('"');
    }
    while let Some(closer) = stack.pop() {
        output.push(closer);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_picks_keyword_category() {
        let manager = FallbackManager::default();
        assert_eq!(manager.classify("how to sort a list in code"), "coding");
        assert_eq!(manager.classify("hello there"), "chat");
        assert_eq!(manager.classify("zzzz"), "general");
    }

    #[test]
    fn repairs_trailing_commas_and_fences() {
        let manager = FallbackManager::default();
        let suspect = "```json\n{\"tasks\": [{\"id\": 1},],}\n```";
        let repaired = manager.repair_json(suspect).expect("repairable");
        let value: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["tasks"][0]["id"], 1);
    }

    #[test]
    fn repairs_truncated_output() {
        let manager = FallbackManager::default();
        let suspect = "{\"tasks\": [{\"capability\": \"weather\"";
        let repaired = manager.repair_json(suspect).expect("repairable");
        assert!(serde_json::from_str::<serde_json::Value>(&repaired).is_ok());
    }

    #[test]
    fn unrepairable_garbage_stays_broken() {
        let manager = FallbackManager::default();
        assert!(manager.repair_json("not json at all").is_none());
    }

    #[test]
    fn emergency_response_renders_query() {
        let manager = FallbackManager::default();
        let response = manager
            .emergency_response("how to sort a list in code", "timeout")
            .expect("seeded rule");
        assert!(response.contains("how to sort a list in code"));

        let rules = manager.rules();
        let coding = rules.iter().find(|rule| rule.category == "coding").unwrap();
        assert_eq!(coding.learning_score, 1);
        assert!(coding.last_used.is_some());
    }

    #[test]
    fn learning_upgrades_template_on_better_response() {
        let manager = FallbackManager::default();
        let long_response = "To sort a list in most languages you can rely on the built-in \
            sort routine which implements an adaptive stable merge sort with excellent \
            performance characteristics for nearly sorted data and predictable worst case \
            behavior across collection sizes and element distributions in practice.";
        manager.learn("how do I sort code", long_response);

        let rules = manager.rules();
        let coding = rules.iter().find(|rule| rule.category == "coding").unwrap();
        assert_eq!(coding.template, long_response);
        assert!(!coding.seeded);
    }

    #[test]
    fn prune_keeps_seeded_rules() {
        let manager = FallbackManager::default();
        manager.prune(Duration::from_secs(0));
        assert_eq!(manager.rules().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_full_cycle() {
        let config = BreakerConfig::default()
            .with_failure_threshold(3)
            .with_cooldown(Duration::from_secs(10));
        let breaker = CircuitBreaker::new(config);

        for _ in 0..3 {
            assert!(breaker.allow("llm"));
            breaker.record_failure("llm");
        }
        assert!(breaker.is_open("llm"));
        assert!(!breaker.allow("llm"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!breaker.is_open("llm"));
        assert!(breaker.allow("llm"), "half-open admits one probe");
        breaker.record_success("llm");
        assert!(breaker.allow("llm"));
        assert!(!breaker.is_open("llm"));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let config = BreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_secs(5));
        let breaker = CircuitBreaker::new(config);

        breaker.record_failure("svc");
        assert!(!breaker.allow("svc"));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(breaker.allow("svc"));
        breaker.record_failure("svc");
        assert!(!breaker.allow("svc"));
    }
}
