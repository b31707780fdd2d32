//! The orchestrator agent: plan, route, gather, synthesize.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use amcp_bus::CorrelationTracker;
use amcp_events::{DeliveryOptions, Event};
use amcp_llm::{GenerationParams, LlmClient};
use amcp_primitives::{AgentId, CapabilityId, Topic, TopicPattern};
use amcp_prompts::{PromptLibrary, PromptTemplate, TemplateKey};
use amcp_runtime::{
    Agent, AgentError, AgentResult, AgentServices, CapabilityRecord, EventReactor, HealthStatus,
    LifecycleHooks, Mobile, Persistable, QueryResponse, RegistrationAnnouncement,
    REGISTRY_DEREGISTER_TOPIC, REGISTRY_QUERY_RESPONSE_TOPIC, REGISTRY_REGISTER_TOPIC,
    query_request_event,
};

use crate::plan::{ErrorPolicy, TaskItem, TaskPlan};
use crate::planner::{PlanOutcome, TaskPlanner};

/// User requests enter the orchestration loop here.
pub const ORCHESTRATION_REQUEST_TOPIC: &str = "orchestration.request";
/// Exactly one response event per request leaves here.
pub const ORCHESTRATION_RESPONSE_TOPIC: &str = "orchestration.response";

const SYNTHESIS_TEMPLATE: &str = "synthesis";
const SYNTHESIS_VERSION: u32 = 1;

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    task_timeout: Duration,
    registry_timeout: Duration,
    synthesis_model: Option<String>,
    expiry_interval: Duration,
}

impl OrchestratorConfig {
    /// Sets the per-task response deadline.
    #[must_use]
    pub const fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Sets the registry lookup deadline.
    #[must_use]
    pub const fn with_registry_timeout(mut self, timeout: Duration) -> Self {
        self.registry_timeout = timeout;
        self
    }

    /// Pins the model used for synthesis calls.
    #[must_use]
    pub fn with_synthesis_model(mut self, model: impl Into<String>) -> Self {
        self.synthesis_model = Some(model.into());
        self
    }

    /// Sets the correlation expiry sweep interval.
    #[must_use]
    pub const fn with_expiry_interval(mut self, interval: Duration) -> Self {
        self.expiry_interval = interval;
        self
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(10),
            registry_timeout: Duration::from_secs(5),
            synthesis_model: None,
            expiry_interval: Duration::from_millis(500),
        }
    }
}

struct Inner {
    planner: TaskPlanner,
    llm: Arc<LlmClient>,
    tracker: CorrelationTracker,
    config: OrchestratorConfig,
    library: PromptLibrary,
    capabilities: StdRwLock<HashMap<AgentId, BTreeSet<CapabilityId>>>,
    response_subscriptions: tokio::sync::Mutex<HashSet<CapabilityId>>,
    expiry: StdMutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn known_capabilities(&self) -> BTreeSet<CapabilityId> {
        self.capabilities
            .read()
            .expect("capability view lock poisoned")
            .values()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Decomposes natural-language requests into capability-tagged tasks,
/// fans them out on the bus, and synthesizes the final answer.
pub struct OrchestratorAgent {
    inner: Arc<Inner>,
}

impl OrchestratorAgent {
    /// Creates an orchestrator wired to the given planner and connector.
    #[must_use]
    pub fn new(planner: TaskPlanner, llm: Arc<LlmClient>, config: OrchestratorConfig) -> Self {
        let library = PromptLibrary::new();
        let template = PromptTemplate::builder(
            "Combine the task results below into one coherent answer.\n\
             User request: {{query}}\n\
             Task results:\n{{results}}\n\
             Answer concisely, covering every result.",
        )
        .with_required_variable("query")
        .with_required_variable("results")
        .build()
        .expect("synthesis template is well-formed");
        library.insert(TemplateKey::new(SYNTHESIS_TEMPLATE, SYNTHESIS_VERSION), template);

        Self {
            inner: Arc::new(Inner {
                planner,
                llm,
                tracker: CorrelationTracker::new(),
                config,
                library,
                capabilities: StdRwLock::new(HashMap::new()),
                response_subscriptions: tokio::sync::Mutex::new(HashSet::new()),
                expiry: StdMutex::new(None),
            }),
        }
    }

    /// Returns the correlation tracker (exposed for tests and metrics).
    #[must_use]
    pub fn tracker(&self) -> &CorrelationTracker {
        &self.inner.tracker
    }
}

#[async_trait]
impl EventReactor for OrchestratorAgent {
    async fn on_event(&self, services: &AgentServices, event: Event) -> AgentResult {
        let topic = event.topic().as_str();

        if topic == ORCHESTRATION_REQUEST_TOPIC {
            // The workflow awaits task responses that arrive through this
            // same handler, so it must not hold the agent's serial slot.
            let inner = Arc::clone(&self.inner);
            let services = services.clone();
            tokio::spawn(run_request(inner, services, event));
            return Ok(());
        }

        if topic == REGISTRY_QUERY_RESPONSE_TOPIC
            || (topic.starts_with("task.") && topic.ends_with(".response"))
        {
            if let (Some(correlation_id), Some(data)) = (event.correlation_id(), event.data()) {
                self.inner
                    .tracker
                    .record_response(correlation_id, data.clone())
                    .await;
            }
            return Ok(());
        }

        match topic {
            REGISTRY_REGISTER_TOPIC => {
                let announcement: RegistrationAnnouncement = event
                    .data_as()
                    .map_err(|err| AgentError::handler(err.to_string()))?;
                self.inner
                    .capabilities
                    .write()
                    .expect("capability view lock poisoned")
                    .insert(
                        announcement.agent_id,
                        announcement.capabilities.into_iter().collect(),
                    );
                Ok(())
            }
            REGISTRY_DEREGISTER_TOPIC => {
                if let Some(sender) = event.sender() {
                    self.inner
                        .capabilities
                        .write()
                        .expect("capability view lock poisoned")
                        .remove(sender);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl LifecycleHooks for OrchestratorAgent {
    async fn on_activate(&self, _services: &AgentServices) -> AgentResult {
        let handle = self
            .inner
            .tracker
            .spawn_expiry_task(self.inner.config.expiry_interval);
        *self.inner.expiry.lock().expect("expiry lock poisoned") = Some(handle);
        Ok(())
    }

    async fn on_deactivate(&self, _services: &AgentServices) -> AgentResult {
        if let Some(handle) = self.inner.expiry.lock().expect("expiry lock poisoned").take() {
            handle.abort();
        }
        self.inner.tracker.cancel_all().await;
        Ok(())
    }

    async fn on_destroy(&self, services: &AgentServices) -> AgentResult {
        self.on_deactivate(services).await
    }
}

impl Mobile for OrchestratorAgent {}
impl Persistable for OrchestratorAgent {}

impl Agent for OrchestratorAgent {
    fn agent_type(&self) -> &str {
        "orchestrator"
    }

    fn subscriptions(&self) -> Vec<TopicPattern> {
        [
            ORCHESTRATION_REQUEST_TOPIC,
            REGISTRY_REGISTER_TOPIC,
            REGISTRY_DEREGISTER_TOPIC,
            REGISTRY_QUERY_RESPONSE_TOPIC,
        ]
        .into_iter()
        .map(|topic| TopicPattern::parse(topic).expect("static pattern is valid"))
        .collect()
    }
}

async fn run_request(inner: Arc<Inner>, services: AgentServices, event: Event) {
    let query = event
        .data()
        .and_then(|data| data.get("query"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let correlation = event
        .correlation_id()
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);
    let trace = event
        .trace_id()
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);

    if query.is_empty() {
        emit_error(&services, &correlation, &trace, &query, "request carries no query").await;
        return;
    }

    info!(trace_id = %trace, "orchestration started");
    let known = inner.known_capabilities();
    let outcome = match inner.planner.plan(&query, &known, &trace).await {
        Ok(outcome) => outcome,
        Err(err) => {
            emit_error(&services, &correlation, &trace, &query, &err.to_string()).await;
            return;
        }
    };

    match outcome {
        PlanOutcome::Degraded { response } => {
            emit_response(
                &services,
                &correlation,
                &trace,
                &query,
                &response,
                true,
                &BTreeMap::new(),
                &BTreeMap::new(),
            )
            .await;
        }
        PlanOutcome::Planned(plan) => {
            let gathered = execute_plan(&inner, &services, &plan, &trace).await;
            let (text, degraded) = synthesize(&inner, &query, &gathered).await;
            emit_response(
                &services,
                &correlation,
                &trace,
                &query,
                &text,
                degraded || !gathered.failures.is_empty(),
                &gathered.correlations,
                &gathered.failures,
            )
            .await;
        }
    }
}

struct GatheredResults {
    results: BTreeMap<String, Value>,
    failures: BTreeMap<String, String>,
    correlations: BTreeMap<String, String>,
}

async fn execute_plan(
    inner: &Arc<Inner>,
    services: &AgentServices,
    plan: &TaskPlan,
    trace: &str,
) -> GatheredResults {
    let mut completed: BTreeSet<String> = BTreeSet::new();
    let mut abandoned: BTreeSet<String> = BTreeSet::new();
    let mut gathered = GatheredResults {
        results: BTreeMap::new(),
        failures: BTreeMap::new(),
        correlations: BTreeMap::new(),
    };

    loop {
        let wave: Vec<TaskItem> = plan
            .runnable(&completed, &abandoned)
            .into_iter()
            .cloned()
            .collect();
        if wave.is_empty() {
            break;
        }

        let dispatches = wave
            .iter()
            .map(|task| dispatch_task(inner, services, task, trace));
        let outcomes = futures::future::join_all(dispatches).await;

        let mut wave_failed = false;
        for (task, outcome) in wave.iter().zip(outcomes) {
            gathered
                .correlations
                .insert(task.task_id.clone(), outcome.correlation_id);
            match outcome.result {
                Ok(payload) => {
                    completed.insert(task.task_id.clone());
                    gathered.results.insert(task.task_id.clone(), payload);
                }
                Err(reason) => {
                    warn!(task_id = %task.task_id, reason, "task failed");
                    abandoned.insert(task.task_id.clone());
                    gathered.failures.insert(task.task_id.clone(), reason);
                    wave_failed = true;
                }
            }
        }

        if wave_failed && plan.on_error == ErrorPolicy::FailFast {
            for task in &plan.tasks {
                if !completed.contains(&task.task_id) {
                    abandoned.insert(task.task_id.clone());
                }
            }
            break;
        }
    }

    gathered
}

struct TaskOutcome {
    correlation_id: String,
    result: Result<Value, String>,
}

async fn dispatch_task(
    inner: &Arc<Inner>,
    services: &AgentServices,
    task: &TaskItem,
    trace: &str,
) -> TaskOutcome {
    let correlation_id = Uuid::new_v4().to_string();

    let target = match resolve_agent(inner, services, task).await {
        Ok(target) => target,
        Err(reason) => {
            return TaskOutcome {
                correlation_id,
                result: Err(reason),
            };
        }
    };

    if let Err(reason) = ensure_response_subscription(inner, services, &task.capability).await {
        return TaskOutcome {
            correlation_id,
            result: Err(reason),
        };
    }

    let mut context = BTreeMap::new();
    context.insert("task_id".to_owned(), task.task_id.clone());
    let pending = match inner
        .tracker
        .register(
            correlation_id.clone(),
            Some(target.clone()),
            context,
            inner.config.task_timeout,
        )
        .await
    {
        Ok(pending) => pending,
        Err(err) => {
            return TaskOutcome {
                correlation_id,
                result: Err(err.to_string()),
            };
        }
    };

    let topic = match Topic::parse(format!("task.{}.request", task.capability)) {
        Ok(topic) => topic,
        Err(err) => {
            inner.tracker.cancel(&correlation_id).await;
            return TaskOutcome {
                correlation_id,
                result: Err(err.to_string()),
            };
        }
    };

    let request = services
        .event(topic)
        .event_type("io.amcp.task.request")
        .correlation_id(correlation_id.clone())
        .trace_id(trace)
        .delivery(DeliveryOptions::Reliable)
        .data(json!({
            "taskId": task.task_id,
            "capability": task.capability,
            "params": task.params,
            "targetAgent": target.to_string(),
        }))
        .build();
    let request = match request {
        Ok(request) => request,
        Err(err) => {
            inner.tracker.cancel(&correlation_id).await;
            return TaskOutcome {
                correlation_id,
                result: Err(err.to_string()),
            };
        }
    };

    debug!(task_id = %task.task_id, capability = %task.capability, "task dispatched");
    if let Err(err) = services.publish(request).await {
        inner.tracker.cancel(&correlation_id).await;
        return TaskOutcome {
            correlation_id,
            result: Err(err.to_string()),
        };
    }

    TaskOutcome {
        result: pending.outcome().await.map_err(|err| err.to_string()),
        correlation_id,
    }
}

async fn resolve_agent(
    inner: &Arc<Inner>,
    services: &AgentServices,
    task: &TaskItem,
) -> Result<AgentId, String> {
    let correlation_id = Uuid::new_v4().to_string();
    let pending = inner
        .tracker
        .register(
            correlation_id.clone(),
            None,
            BTreeMap::new(),
            inner.config.registry_timeout,
        )
        .await
        .map_err(|err| err.to_string())?;

    let source = format!(
        "amcp://{}/{}",
        services.context_id(),
        services.agent_id().name()
    );
    let request = query_request_event(&source, &task.capability, &correlation_id)
        .map_err(|err| err.to_string())?;
    services
        .publish(request)
        .await
        .map_err(|err| err.to_string())?;

    let payload = pending
        .outcome()
        .await
        .map_err(|err| format!("registry lookup failed: {err}"))?;
    let response: QueryResponse =
        serde_json::from_value(payload).map_err(|err| format!("malformed registry answer: {err}"))?;

    pick_candidate(&response.candidates, task.target_agent_hint.as_deref())
        .ok_or_else(|| format!("no reachable agent provides `{}`", task.capability))
}

/// Candidates arrive ranked; the hint promotes a matching name, and
/// unreachable agents are never picked.
fn pick_candidate(candidates: &[CapabilityRecord], hint: Option<&str>) -> Option<AgentId> {
    let reachable = candidates
        .iter()
        .filter(|candidate| candidate.health != HealthStatus::Unreachable);
    if let Some(hint) = hint {
        if let Some(preferred) = candidates
            .iter()
            .find(|candidate| candidate.agent_id.name() == hint)
        {
            if preferred.health != HealthStatus::Unreachable {
                return Some(preferred.agent_id.clone());
            }
        }
    }
    reachable.map(|candidate| candidate.agent_id.clone()).next()
}

async fn ensure_response_subscription(
    inner: &Arc<Inner>,
    services: &AgentServices,
    capability: &CapabilityId,
) -> Result<(), String> {
    let mut subscribed = inner.response_subscriptions.lock().await;
    if subscribed.contains(capability) {
        return Ok(());
    }
    let pattern = TopicPattern::parse(format!("task.{capability}.response"))
        .map_err(|err| err.to_string())?;
    services
        .subscribe(pattern)
        .await
        .map_err(|err| err.to_string())?;
    subscribed.insert(capability.clone());
    Ok(())
}

async fn synthesize(
    inner: &Arc<Inner>,
    query: &str,
    gathered: &GatheredResults,
) -> (String, bool) {
    if gathered.results.is_empty() {
        return (compose_summary(query, gathered), true);
    }

    let template = inner
        .library
        .get(SYNTHESIS_TEMPLATE, SYNTHESIS_VERSION)
        .expect("synthesis template installed in constructor");
    let mut variables = HashMap::new();
    variables.insert("query".to_owned(), query.to_owned());
    variables.insert(
        "results".to_owned(),
        gathered
            .results
            .iter()
            .map(|(task_id, value)| format!("- {task_id}: {value}"))
            .collect::<Vec<_>>()
            .join("\n"),
    );
    let Ok(prompt) = template.render_with(&variables) else {
        return (compose_summary(query, gathered), true);
    };

    match inner
        .llm
        .generate(
            &prompt,
            inner.config.synthesis_model.as_deref(),
            &GenerationParams::default(),
        )
        .await
    {
        Ok(reply) if !reply.is_degraded() => (reply.into_text(), false),
        // A degraded synthesis answer would hide the real task results;
        // compose the structured summary instead.
        Ok(_) | Err(_) => (compose_summary(query, gathered), true),
    }
}

fn compose_summary(query: &str, gathered: &GatheredResults) -> String {
    let mut lines = vec![format!("Results for \"{query}\":")];
    for (task_id, value) in &gathered.results {
        lines.push(format!("- {task_id}: {value}"));
    }
    for (task_id, reason) in &gathered.failures {
        lines.push(format!("- {task_id}: failed ({reason})"));
    }
    if gathered.results.is_empty() && gathered.failures.is_empty() {
        lines.push("- no task produced a result".to_owned());
    }
    lines.join("\n")
}

#[allow(clippy::too_many_arguments)]
async fn emit_response(
    services: &AgentServices,
    correlation: &str,
    trace: &str,
    query: &str,
    text: &str,
    degraded: bool,
    task_correlations: &BTreeMap<String, String>,
    failures: &BTreeMap<String, String>,
) {
    let topic = Topic::parse(ORCHESTRATION_RESPONSE_TOPIC).expect("static topic is valid");
    let mut builder = services
        .event(topic)
        .event_type("io.amcp.orchestration.response")
        .correlation_id(correlation)
        .trace_id(trace)
        .delivery(DeliveryOptions::Reliable)
        .metadata_entry("degraded", degraded.to_string())
        .data(json!({
            "query": query,
            "response": text,
            "failedTasks": failures,
        }));
    for (task_id, task_correlation) in task_correlations {
        builder = builder.metadata_entry(format!("correlation.{task_id}"), task_correlation.clone());
    }
    match builder.build() {
        Ok(event) => {
            if let Err(err) = services.publish(event).await {
                warn!(error = %err, "orchestration response not published");
            }
        }
        Err(err) => warn!(error = %err, "orchestration response envelope invalid"),
    }
}

async fn emit_error(
    services: &AgentServices,
    correlation: &str,
    trace: &str,
    query: &str,
    reason: &str,
) {
    warn!(trace_id = %trace, reason, "orchestration failed");
    let topic = Topic::parse(ORCHESTRATION_RESPONSE_TOPIC).expect("static topic is valid");
    let event = services
        .event(topic)
        .event_type("io.amcp.orchestration.error")
        .correlation_id(correlation)
        .trace_id(trace)
        .delivery(DeliveryOptions::Reliable)
        .metadata_entry("degraded", "true")
        .data(json!({"query": query, "error": reason}))
        .build();
    match event {
        Ok(event) => {
            if let Err(err) = services.publish(event).await {
                warn!(error = %err, "orchestration error event not published");
            }
        }
        Err(err) => warn!(error = %err, "orchestration error envelope invalid"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(name: &str, health: HealthStatus) -> CapabilityRecord {
        CapabilityRecord {
            agent_id: AgentId::new(name, "test").unwrap(),
            agent_type: name.to_owned(),
            capabilities: [CapabilityId::new("weather").unwrap()].into_iter().collect(),
            context_id: amcp_primitives::ContextId::new("testctx").unwrap(),
            last_heartbeat: Utc::now(),
            health,
            latency_hint_ms: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn pick_candidate_skips_unreachable_and_honors_hint() {
        let candidates = vec![
            record("down", HealthStatus::Unreachable),
            record("primary", HealthStatus::Healthy),
            record("secondary", HealthStatus::Degraded),
        ];

        let chosen = pick_candidate(&candidates, None).unwrap();
        assert_eq!(chosen.name(), "primary");

        let hinted = pick_candidate(&candidates, Some("secondary")).unwrap();
        assert_eq!(hinted.name(), "secondary");

        // An unreachable hint falls back to ranking order.
        let fallback = pick_candidate(&candidates, Some("down")).unwrap();
        assert_eq!(fallback.name(), "primary");

        assert!(pick_candidate(&[record("only", HealthStatus::Unreachable)], None).is_none());
    }

    #[test]
    fn summary_covers_results_and_failures() {
        let gathered = GatheredResults {
            results: [("t1".to_owned(), json!({"temp": 21}))].into_iter().collect(),
            failures: [("t2".to_owned(), "timeout".to_owned())].into_iter().collect(),
            correlations: BTreeMap::new(),
        };
        let summary = compose_summary("weather", &gathered);
        assert!(summary.contains("t1"));
        assert!(summary.contains("21"));
        assert!(summary.contains("t2"));
        assert!(summary.contains("timeout"));
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.task_timeout, Duration::from_secs(10));
        assert_eq!(config.registry_timeout, Duration::from_secs(5));
        assert!(config.synthesis_model.is_none());
    }
}
