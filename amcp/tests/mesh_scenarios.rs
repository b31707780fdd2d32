//! End-to-end mesh scenarios: wildcard routing, ordering, mobility,
//! orchestration, degradation, and dead-lettering.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use amcp::bus::{DEADLETTER_TOPIC, EventBroker, InMemoryBroker, handler_fn};
use amcp::events::{DeliveryOptions, Event};
use amcp::llm::{BreakerConfig, FallbackManager, LlmClient, LlmConfig};
use amcp::orchestrator::{
    ORCHESTRATION_REQUEST_TOPIC, ORCHESTRATION_RESPONSE_TOPIC, OrchestratorAgent,
    OrchestratorConfig, PlannerConfig, TaskPlanner,
};
use amcp::primitives::{AgentId, CapabilityId, ContextId, Topic, TopicPattern};
use amcp::runtime::{
    Agent, AgentContext, AgentError, AgentResult, AgentServices, AgentState, EventReactor,
    LifecycleHooks, Mobile, MobilityConfig, Persistable, RegistrationAnnouncement, RegistryAgent,
    RegistryConfig, RuntimeConfig, registration_event,
};

fn topic(raw: &str) -> Topic {
    Topic::parse(raw).expect("topic")
}

fn pattern(raw: &str) -> TopicPattern {
    TopicPattern::parse(raw).expect("pattern")
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

async fn started_broker() -> Arc<dyn EventBroker> {
    init_tracing();
    let broker: Arc<dyn EventBroker> = Arc::new(InMemoryBroker::with_defaults());
    broker.start().await.expect("broker start");
    broker
}

async fn started_context(broker: &Arc<dyn EventBroker>, id: &str) -> AgentContext {
    let config = RuntimeConfig::default()
        .with_mobility(MobilityConfig::default().with_timeout(Duration::from_secs(2)));
    let context = AgentContext::new(ContextId::new(id).unwrap(), Arc::clone(broker), config)
        .expect("context");
    context.start().await.expect("context start");
    context
}

/// Collects every event delivered on the patterns it is subscribed with.
struct RecordingAgent {
    patterns: Vec<TopicPattern>,
    seen: StdMutex<Vec<Event>>,
}

impl RecordingAgent {
    fn new(patterns: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            patterns: patterns.iter().map(|raw| pattern(raw)).collect(),
            seen: StdMutex::new(Vec::new()),
        })
    }

    fn topics_seen(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.topic().as_str().to_owned())
            .collect()
    }
}

#[async_trait]
impl EventReactor for RecordingAgent {
    async fn on_event(&self, _services: &AgentServices, event: Event) -> AgentResult {
        self.seen.lock().unwrap().push(event);
        Ok(())
    }
}

impl LifecycleHooks for RecordingAgent {}
impl Mobile for RecordingAgent {}
impl Persistable for RecordingAgent {}

impl Agent for RecordingAgent {
    fn agent_type(&self) -> &str {
        "recording"
    }

    fn subscriptions(&self) -> Vec<TopicPattern> {
        self.patterns.clone()
    }
}

#[tokio::test]
async fn wildcard_subscriptions_route_to_matching_agents_only() {
    let broker = started_broker().await;
    let context = started_context(&broker, "edge1").await;

    let wide = RecordingAgent::new(&["weather.**"]);
    let narrow = RecordingAgent::new(&["weather.alert.*"]);
    let wide_id = AgentId::new("wide", "test").unwrap();
    let narrow_id = AgentId::new("narrow", "test").unwrap();

    context
        .register_agent(wide_id.clone(), Arc::clone(&wide) as Arc<dyn Agent>)
        .await
        .unwrap();
    context
        .register_agent(narrow_id.clone(), Arc::clone(&narrow) as Arc<dyn Agent>)
        .await
        .unwrap();
    context.activate_agent(&wide_id).await.unwrap();
    context.activate_agent(&narrow_id).await.unwrap();

    for (topic_str, payload) in [("weather.alert.storm", "x"), ("weather.temperature", "y")] {
        let event = Event::builder(topic(topic_str))
            .event_type("io.amcp.weather.updated")
            .source("amcp://edge1/ingress")
            .data(json!(payload))
            .build()
            .unwrap();
        context.publish(event).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut wide_topics = wide.topics_seen();
    wide_topics.sort();
    assert_eq!(
        wide_topics,
        vec!["weather.alert.storm", "weather.temperature"]
    );
    assert_eq!(narrow.topics_seen(), vec!["weather.alert.storm"]);
}

/// A deliberately slow agent recording payload markers in arrival order.
struct SlowAgent {
    seen: StdMutex<Vec<String>>,
}

#[async_trait]
impl EventReactor for SlowAgent {
    async fn on_event(&self, _services: &AgentServices, event: Event) -> AgentResult {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let marker = event
            .data()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        self.seen.lock().unwrap().push(marker);
        Ok(())
    }
}

impl LifecycleHooks for SlowAgent {}
impl Mobile for SlowAgent {}
impl Persistable for SlowAgent {}

impl Agent for SlowAgent {
    fn agent_type(&self) -> &str {
        "slow"
    }

    fn subscriptions(&self) -> Vec<TopicPattern> {
        vec![pattern("t.a")]
    }
}

#[tokio::test]
async fn correlated_events_arrive_in_publish_order() {
    let broker = started_broker().await;
    let context = started_context(&broker, "edge1").await;

    let agent = Arc::new(SlowAgent {
        seen: StdMutex::new(Vec::new()),
    });
    let agent_id = AgentId::new("slow", "test").unwrap();
    context
        .register_agent(agent_id.clone(), Arc::clone(&agent) as Arc<dyn Agent>)
        .await
        .unwrap();
    context.activate_agent(&agent_id).await.unwrap();

    for (correlation, marker) in [
        ("c1", "c1-1"),
        ("c2", "c2-1"),
        ("c1", "c1-2"),
        ("c2", "c2-2"),
        ("c1", "c1-3"),
    ] {
        let event = Event::builder(topic("t.a"))
            .event_type("io.amcp.test.ordered")
            .source("amcp://edge1/ingress")
            .correlation_id(correlation)
            .delivery(DeliveryOptions::OrderedByCorrelation)
            .data(json!(marker))
            .build()
            .unwrap();
        context.publish(event).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    let seen = agent.seen.lock().unwrap().clone();
    let c1: Vec<&str> = seen
        .iter()
        .filter(|marker| marker.starts_with("c1"))
        .map(String::as_str)
        .collect();
    let c2: Vec<&str> = seen
        .iter()
        .filter(|marker| marker.starts_with("c2"))
        .map(String::as_str)
        .collect();
    assert_eq!(c1, ["c1-1", "c1-2", "c1-3"]);
    assert_eq!(c2, ["c2-1", "c2-2"]);
}

/// Counter agent with explicit persistent state and a shared hook log.
struct CounterAgent {
    counter: StdMutex<u64>,
    hook_log: Arc<StdMutex<Vec<String>>>,
}

impl CounterAgent {
    fn with_log(hook_log: Arc<StdMutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            counter: StdMutex::new(0),
            hook_log,
        })
    }
}

#[async_trait]
impl EventReactor for CounterAgent {
    async fn on_event(&self, _services: &AgentServices, _event: Event) -> AgentResult {
        *self.counter.lock().unwrap() += 1;
        Ok(())
    }
}

impl LifecycleHooks for CounterAgent {}

#[async_trait]
impl Mobile for CounterAgent {
    async fn on_before_migration(
        &self,
        _services: &AgentServices,
        destination: &ContextId,
    ) -> AgentResult {
        self.hook_log
            .lock()
            .unwrap()
            .push(format!("before:{destination}"));
        Ok(())
    }

    async fn on_after_migration(
        &self,
        _services: &AgentServices,
        source: &ContextId,
    ) -> AgentResult {
        self.hook_log.lock().unwrap().push(format!("after:{source}"));
        Ok(())
    }
}

impl Persistable for CounterAgent {
    fn capture_state(&self) -> AgentResult<Value> {
        Ok(json!({"counter": *self.counter.lock().unwrap()}))
    }

    fn restore_state(&self, state: Value) -> AgentResult {
        let value = state
            .get("counter")
            .and_then(Value::as_u64)
            .ok_or_else(|| AgentError::restore("missing counter"))?;
        *self.counter.lock().unwrap() = value;
        Ok(())
    }
}

impl Agent for CounterAgent {
    fn agent_type(&self) -> &str {
        "counter"
    }

    fn subscriptions(&self) -> Vec<TopicPattern> {
        vec![pattern("count.*")]
    }
}

#[tokio::test]
async fn dispatch_round_trip_preserves_state_and_hook_order() {
    let broker = started_broker().await;
    let source = started_context(&broker, "src").await;
    let destination = started_context(&broker, "dst").await;

    let hook_log = Arc::new(StdMutex::new(Vec::new()));
    let factory_log = Arc::clone(&hook_log);
    for context in [&source, &destination] {
        let factory_log = Arc::clone(&factory_log);
        context.factories().register(
            "counter",
            Arc::new(move || {
                CounterAgent::with_log(Arc::clone(&factory_log)) as Arc<dyn Agent>
            }),
        );
    }

    let (completed_tx, mut completed_rx) = mpsc::unbounded_channel();
    broker
        .subscribe(
            "observer",
            pattern("system.mobility.completed"),
            handler_fn(move |event: Event| {
                let completed_tx = completed_tx.clone();
                async move {
                    let _ = completed_tx.send(event);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    let agent = CounterAgent::with_log(Arc::clone(&hook_log));
    *agent.counter.lock().unwrap() = 5;
    let agent_id = AgentId::new("counter", "demo").unwrap();
    source
        .register_agent(agent_id.clone(), Arc::clone(&agent) as Arc<dyn Agent>)
        .await
        .unwrap();
    source.activate_agent(&agent_id).await.unwrap();

    source
        .mobility()
        .dispatch(&agent_id, ContextId::new("dst").unwrap())
        .await
        .unwrap();

    assert!(!source.owns(&agent_id).await);
    assert!(destination.owns(&agent_id).await);
    assert_eq!(
        destination.agent_state(&agent_id).await,
        Some(AgentState::Active)
    );

    // The hook ordering is global across both instances of the agent.
    let log = hook_log.lock().unwrap().clone();
    assert_eq!(log, vec!["before:dst".to_owned(), "after:src".to_owned()]);

    let completed = timeout(Duration::from_secs(2), completed_rx.recv())
        .await
        .expect("completed event within deadline")
        .expect("channel open");
    assert_eq!(completed.topic().as_str(), "system.mobility.completed");
}

/// Answers `task.weather.request` events with a canned forecast.
struct WeatherAgent;

#[async_trait]
impl EventReactor for WeatherAgent {
    async fn on_event(&self, services: &AgentServices, event: Event) -> AgentResult {
        let city = event
            .data()
            .and_then(|data| data.get("params"))
            .and_then(|params| params.get("city"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        let mut builder = services
            .event(topic("task.weather.response"))
            .event_type("io.amcp.task.response")
            .delivery(DeliveryOptions::Reliable)
            .data(json!({"city": city, "forecast": "sunny", "temperature": 21}));
        if let Some(correlation_id) = event.correlation_id() {
            builder = builder.correlation_id(correlation_id);
        }
        services.publish(builder.build()?).await
    }
}

impl LifecycleHooks for WeatherAgent {}
impl Mobile for WeatherAgent {}
impl Persistable for WeatherAgent {}

impl Agent for WeatherAgent {
    fn agent_type(&self) -> &str {
        "weather"
    }

    fn subscriptions(&self) -> Vec<TopicPattern> {
        vec![pattern("task.weather.request")]
    }
}

fn llm_with_canned_plan() -> Arc<LlmClient> {
    let plan = json!({
        "tasks": [
            {"task_id": "paris", "capability": "weather", "params": {"city": "Paris"},
             "dependencies": [], "priority": "medium"},
            {"task_id": "rome", "capability": "weather", "params": {"city": "Rome"},
             "dependencies": [], "priority": "medium"}
        ]
    });
    let config = LlmConfig::new("gemma3")
        .with_mock_responses(true)
        .with_mock_reply(plan.to_string())
        .with_cache_enabled(false);
    Arc::new(
        LlmClient::new(config, Arc::new(FallbackManager::new(BreakerConfig::default()))).unwrap(),
    )
}

async fn install_orchestration(
    broker: &Arc<dyn EventBroker>,
    context: &AgentContext,
    llm: Arc<LlmClient>,
) -> mpsc::UnboundedReceiver<Event> {
    // Registry agent answering capability lookups.
    let registry = Arc::new(RegistryAgent::new(RegistryConfig::default()));
    let registry_id = AgentId::new("registry", "system").unwrap();
    context
        .register_agent(registry_id.clone(), registry as Arc<dyn Agent>)
        .await
        .unwrap();
    context.activate_agent(&registry_id).await.unwrap();

    // Weather specialist.
    let weather_id = AgentId::new("weather-agent", "demo").unwrap();
    context
        .register_agent(weather_id.clone(), Arc::new(WeatherAgent) as Arc<dyn Agent>)
        .await
        .unwrap();
    context.activate_agent(&weather_id).await.unwrap();

    // Orchestrator wired to the supplied connector.
    let planner = TaskPlanner::new(
        Arc::clone(&llm),
        PlannerConfig::new(CapabilityId::new("chat").unwrap()),
    );
    let orchestrator = OrchestratorAgent::new(planner, llm, OrchestratorConfig::default());
    let orchestrator_id = AgentId::new("orchestrator", "system").unwrap();
    context
        .register_agent(orchestrator_id.clone(), Arc::new(orchestrator) as Arc<dyn Agent>)
        .await
        .unwrap();
    context.activate_agent(&orchestrator_id).await.unwrap();

    // Announce the specialist so both the registry and the orchestrator's
    // capability view learn about it.
    let announcement = RegistrationAnnouncement {
        agent_id: weather_id,
        agent_type: "weather".to_owned(),
        capabilities: vec![CapabilityId::new("weather").unwrap()],
        context_id: context.context_id().clone(),
        latency_hint_ms: Some(5),
        metadata: BTreeMap::new(),
    };
    broker
        .publish(registration_event("amcp://edge1/weather-agent", &announcement).unwrap())
        .await
        .unwrap();

    // Response observer.
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    broker
        .subscribe(
            "response-observer",
            pattern(ORCHESTRATION_RESPONSE_TOPIC),
            handler_fn(move |event: Event| {
                let response_tx = response_tx.clone();
                async move {
                    let _ = response_tx.send(event);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    response_rx
}

#[tokio::test]
async fn orchestration_happy_path_consolidates_parallel_tasks() {
    let broker = started_broker().await;
    let context = started_context(&broker, "edge1").await;
    let mut responses = install_orchestration(&broker, &context, llm_with_canned_plan()).await;

    let request = Event::builder(topic(ORCHESTRATION_REQUEST_TOPIC))
        .event_type("io.amcp.orchestration.request")
        .source("amcp://edge1/ingress")
        .correlation_id("user-req-1")
        .data(json!({"query": "weather in Paris and Rome"}))
        .build()
        .unwrap();
    broker.publish(request).await.unwrap();

    let response = timeout(Duration::from_secs(10), responses.recv())
        .await
        .expect("response within deadline")
        .expect("channel open");

    assert_eq!(response.correlation_id(), Some("user-req-1"));
    assert_eq!(
        response.metadata().get("degraded").map(String::as_str),
        Some("false")
    );
    // Both task correlation ids are carried in the response metadata.
    assert!(response.metadata().contains_key("correlation.paris"));
    assert!(response.metadata().contains_key("correlation.rome"));
    let data = response.data().expect("payload");
    assert_eq!(data["failedTasks"], json!({}));
}

#[tokio::test]
async fn unreachable_llm_degrades_with_category_template() {
    let broker = started_broker().await;
    let context = started_context(&broker, "edge1").await;

    let fallback = Arc::new(FallbackManager::new(BreakerConfig::default()));
    let config = LlmConfig::new("gemma3")
        .with_base_url("http://127.0.0.1:9")
        .with_max_retries(0)
        .with_cache_enabled(false);
    let llm = Arc::new(LlmClient::new(config, fallback).unwrap());
    let mut responses = install_orchestration(&broker, &context, Arc::clone(&llm)).await;

    let request = Event::builder(topic(ORCHESTRATION_REQUEST_TOPIC))
        .event_type("io.amcp.orchestration.request")
        .source("amcp://edge1/ingress")
        .correlation_id("user-req-2")
        .data(json!({"query": "how to sort a list in code"}))
        .build()
        .unwrap();
    broker.publish(request).await.unwrap();

    let response = timeout(Duration::from_secs(10), responses.recv())
        .await
        .expect("degraded response within deadline")
        .expect("channel open");

    assert_eq!(
        response.metadata().get("degraded").map(String::as_str),
        Some("true")
    );
    let data = response.data().expect("payload");
    let text = data["response"].as_str().expect("response text");
    assert!(text.contains("how to sort a list in code"));

    let stats = llm.stats();
    assert!(stats.fallbacks_used >= 1);
    assert!(stats.failures >= 1);
}

/// Always fails, to exercise the retry-then-deadletter path.
struct FailingAgent {
    attempts: AtomicU32,
}

#[async_trait]
impl EventReactor for FailingAgent {
    async fn on_event(&self, _services: &AgentServices, _event: Event) -> AgentResult {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::handler("intentional failure"))
    }
}

impl LifecycleHooks for FailingAgent {}
impl Mobile for FailingAgent {}
impl Persistable for FailingAgent {}

impl Agent for FailingAgent {
    fn agent_type(&self) -> &str {
        "failing"
    }

    fn subscriptions(&self) -> Vec<TopicPattern> {
        vec![pattern("orders.created")]
    }
}

#[tokio::test]
async fn reliable_handler_failure_dead_letters_once_and_keeps_agent_healthy() {
    let broker = started_broker().await;
    let context = started_context(&broker, "edge1").await;

    let agent = Arc::new(FailingAgent {
        attempts: AtomicU32::new(0),
    });
    let agent_id = AgentId::new("failing", "test").unwrap();
    context
        .register_agent(agent_id.clone(), Arc::clone(&agent) as Arc<dyn Agent>)
        .await
        .unwrap();
    context.activate_agent(&agent_id).await.unwrap();

    let (dead_tx, mut dead_rx) = mpsc::unbounded_channel();
    broker
        .subscribe(
            "dead-observer",
            pattern(DEADLETTER_TOPIC),
            handler_fn(move |event: Event| {
                let dead_tx = dead_tx.clone();
                async move {
                    let _ = dead_tx.send(event);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    let event = Event::builder(topic("orders.created"))
        .event_type("io.amcp.orders.created")
        .source("amcp://edge1/ingress")
        .delivery(DeliveryOptions::Reliable)
        .data(json!({"order": 17}))
        .build()
        .unwrap();
    broker.publish(event).await.unwrap();

    let dead = timeout(Duration::from_secs(5), dead_rx.recv())
        .await
        .expect("dead letter within deadline")
        .expect("channel open");
    let payload = dead.data().expect("payload");
    assert!(
        payload["failureReason"]
            .as_str()
            .unwrap()
            .contains("intentional failure")
    );

    // Exactly once per subscriber.
    assert!(
        timeout(Duration::from_millis(300), dead_rx.recv())
            .await
            .is_err(),
        "no second dead letter may arrive"
    );
    // Original delivery plus the configured retries.
    assert!(agent.attempts.load(Ordering::SeqCst) >= 2);

    // The subscriber stays registered, subscribed, and ACTIVE.
    assert_eq!(context.agent_state(&agent_id).await, Some(AgentState::Active));
}

#[tokio::test]
async fn context_shutdown_drains_agents_and_stops_broker() {
    let broker = started_broker().await;
    let context = started_context(&broker, "edge1").await;

    let agent = RecordingAgent::new(&["t.a"]);
    let agent_id = AgentId::new("drained", "test").unwrap();
    context
        .register_agent(agent_id.clone(), agent as Arc<dyn Agent>)
        .await
        .unwrap();
    context.activate_agent(&agent_id).await.unwrap();

    context.shutdown().await.unwrap();
    assert_eq!(
        context.agent_state(&agent_id).await,
        Some(AgentState::Inactive)
    );
    assert!(!broker.is_running());
}
