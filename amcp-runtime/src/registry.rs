//! Capability directory agent.
//!
//! The registry is an ordinary mesh agent listening on the reserved
//! `system.registry.**` tree: agents announce themselves, heartbeat, and are
//! discovered through request/response queries. Health degrades when
//! heartbeats stop arriving.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use amcp_events::{DeliveryOptions, Event, EventResult};
use amcp_primitives::{AgentId, CapabilityId, ContextId, Topic, TopicPattern};

use crate::agent::{
    Agent, AgentError, AgentResult, AgentServices, EventReactor, LifecycleHooks, Mobile,
    Persistable,
};
use crate::context::{RuntimeError, RuntimeResult};

/// Registration announcements arrive here.
pub const REGISTRY_REGISTER_TOPIC: &str = "system.registry.register";
/// Heartbeats arrive here.
pub const REGISTRY_HEARTBEAT_TOPIC: &str = "system.registry.heartbeat";
/// Deregistration announcements arrive here.
pub const REGISTRY_DEREGISTER_TOPIC: &str = "system.registry.deregister";
/// Capability queries arrive here.
pub const REGISTRY_QUERY_REQUEST_TOPIC: &str = "system.registry.query.request";
/// Query answers are published here, correlated to the request.
pub const REGISTRY_QUERY_RESPONSE_TOPIC: &str = "system.registry.query.response";

/// Health classification derived from heartbeat recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Heartbeats are current.
    Healthy,
    /// Heartbeats are late.
    Degraded,
    /// Heartbeats stopped long enough to assume the agent is gone.
    Unreachable,
}

/// Heartbeat and health-window configuration.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    heartbeat_interval: Duration,
    degraded_after: Duration,
    unreachable_after: Duration,
    sweep_interval: Duration,
}

impl RegistryConfig {
    /// Sets the interval agents are expected to heartbeat at.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the silence window after which an agent is DEGRADED.
    #[must_use]
    pub const fn with_degraded_after(mut self, window: Duration) -> Self {
        self.degraded_after = window;
        self
    }

    /// Sets the silence window after which an agent is UNREACHABLE.
    #[must_use]
    pub const fn with_unreachable_after(mut self, window: Duration) -> Self {
        self.unreachable_after = window;
        self
    }

    /// Sets the health sweep interval.
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Returns the expected heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub(crate) fn validate(&self) -> RuntimeResult<()> {
        if self.heartbeat_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "registry intervals must be greater than zero",
            ));
        }
        if self.degraded_after >= self.unreachable_after {
            return Err(RuntimeError::InvalidConfig(
                "degraded window must be shorter than unreachable window",
            ));
        }
        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            degraded_after: Duration::from_secs(30),
            unreachable_after: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Directory entry for one advertised agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRecord {
    /// Identity of the advertised agent.
    pub agent_id: AgentId,
    /// Factory type tag of the agent.
    pub agent_type: String,
    /// Capability tags the agent serves.
    pub capabilities: BTreeSet<CapabilityId>,
    /// Context hosting the agent.
    pub context_id: ContextId,
    /// Timestamp of the last heartbeat or registration.
    pub last_heartbeat: DateTime<Utc>,
    /// Current health classification.
    pub health: HealthStatus,
    /// Advertised average handling latency, used for ranking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_hint_ms: Option<u64>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Payload of `system.registry.register` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationAnnouncement {
    /// Identity being registered.
    pub agent_id: AgentId,
    /// Factory type tag.
    pub agent_type: String,
    /// Capability tags served by the agent.
    pub capabilities: Vec<CapabilityId>,
    /// Hosting context.
    pub context_id: ContextId,
    /// Optional latency hint in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_hint_ms: Option<u64>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HeartbeatAnnouncement {
    agent_id: AgentId,
}

/// Payload of `system.registry.query.request` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Capability the caller needs served.
    pub capability: CapabilityId,
}

/// Payload of `system.registry.query.response` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Capability that was queried.
    pub capability: CapabilityId,
    /// Ranked candidates: health class, then latency hint, then recency.
    pub candidates: Vec<CapabilityRecord>,
    /// Count of returned candidates.
    pub count: usize,
}

/// Builds a registration event for the given announcement.
///
/// # Errors
///
/// Propagates envelope construction errors.
pub fn registration_event(
    source: &str,
    announcement: &RegistrationAnnouncement,
) -> EventResult<Event> {
    Event::builder(Topic::parse(REGISTRY_REGISTER_TOPIC).expect("reserved topic is valid"))
        .event_type("io.amcp.registry.register")
        .source(source)
        .sender(announcement.agent_id.clone())
        .delivery(DeliveryOptions::Reliable)
        .data(serde_json::to_value(announcement)?)
        .build()
}

/// Builds a heartbeat event for the given agent.
///
/// # Errors
///
/// Propagates envelope construction errors.
pub fn heartbeat_event(source: &str, agent_id: &AgentId) -> EventResult<Event> {
    Event::builder(Topic::parse(REGISTRY_HEARTBEAT_TOPIC).expect("reserved topic is valid"))
        .event_type("io.amcp.registry.heartbeat")
        .source(source)
        .sender(agent_id.clone())
        .data(serde_json::to_value(HeartbeatAnnouncement {
            agent_id: agent_id.clone(),
        })?)
        .build()
}

/// Builds a capability query request correlated to the supplied id.
///
/// # Errors
///
/// Propagates envelope construction errors.
pub fn query_request_event(
    source: &str,
    capability: &CapabilityId,
    correlation_id: &str,
) -> EventResult<Event> {
    Event::builder(Topic::parse(REGISTRY_QUERY_REQUEST_TOPIC).expect("reserved topic is valid"))
        .event_type("io.amcp.registry.query")
        .source(source)
        .correlation_id(correlation_id)
        .delivery(DeliveryOptions::Reliable)
        .data(serde_json::to_value(QueryRequest {
            capability: capability.clone(),
        })?)
        .build()
}

type RecordMap = HashMap<AgentId, CapabilityRecord>;

/// The directory agent. Authoritative per context; federation across
/// contexts is out of scope.
pub struct RegistryAgent {
    records: Arc<StdRwLock<RecordMap>>,
    config: RegistryConfig,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl RegistryAgent {
    /// Creates a directory agent with the supplied health windows.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            records: Arc::new(StdRwLock::new(HashMap::new())),
            config,
            sweeper: StdMutex::new(None),
        }
    }

    /// Returns a snapshot of every directory entry.
    #[must_use]
    pub fn records(&self) -> Vec<CapabilityRecord> {
        self.records
            .read()
            .expect("registry records lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Returns candidates serving the capability, ranked by health, latency
    /// hint, and heartbeat recency.
    #[must_use]
    pub fn lookup(&self, capability: &CapabilityId) -> Vec<CapabilityRecord> {
        let records = self.records.read().expect("registry records lock poisoned");
        let mut matches: Vec<CapabilityRecord> = records
            .values()
            .filter(|record| record.capabilities.contains(capability))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            a.health
                .cmp(&b.health)
                .then_with(|| {
                    a.latency_hint_ms
                        .unwrap_or(u64::MAX)
                        .cmp(&b.latency_hint_ms.unwrap_or(u64::MAX))
                })
                .then_with(|| b.last_heartbeat.cmp(&a.last_heartbeat))
        });
        matches
    }

    fn upsert(&self, announcement: RegistrationAnnouncement) {
        let record = CapabilityRecord {
            agent_id: announcement.agent_id.clone(),
            agent_type: announcement.agent_type,
            capabilities: announcement.capabilities.into_iter().collect(),
            context_id: announcement.context_id,
            last_heartbeat: Utc::now(),
            health: HealthStatus::Healthy,
            latency_hint_ms: announcement.latency_hint_ms,
            metadata: announcement.metadata,
        };
        info!(agent_id = %record.agent_id, "registry entry upserted");
        self.records
            .write()
            .expect("registry records lock poisoned")
            .insert(announcement.agent_id, record);
    }

    fn heartbeat(&self, agent_id: &AgentId) {
        let mut records = self.records.write().expect("registry records lock poisoned");
        if let Some(record) = records.get_mut(agent_id) {
            record.last_heartbeat = Utc::now();
            record.health = HealthStatus::Healthy;
        } else {
            debug!(agent_id = %agent_id, "heartbeat from unknown agent ignored");
        }
    }

    fn deregister(&self, agent_id: &AgentId) {
        if self
            .records
            .write()
            .expect("registry records lock poisoned")
            .remove(agent_id)
            .is_some()
        {
            info!(agent_id = %agent_id, "registry entry removed");
        }
    }

    fn sweep(records: &StdRwLock<RecordMap>, config: &RegistryConfig) {
        let now = Utc::now();
        let mut records = records.write().expect("registry records lock poisoned");
        for record in records.values_mut() {
            let silence = now
                .signed_duration_since(record.last_heartbeat)
                .to_std()
                .unwrap_or_default();
            let next = if silence >= config.unreachable_after {
                HealthStatus::Unreachable
            } else if silence >= config.degraded_after {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };
            if next != record.health {
                warn!(agent_id = %record.agent_id, from = ?record.health, to = ?next, "health transition");
                record.health = next;
            }
        }
    }

    async fn answer_query(&self, services: &AgentServices, event: &Event) -> AgentResult {
        let request: QueryRequest = event
            .data_as()
            .map_err(|err| AgentError::handler(format!("malformed query: {err}")))?;
        let candidates = self.lookup(&request.capability);
        let response = QueryResponse {
            capability: request.capability,
            count: candidates.len(),
            candidates,
        };
        let mut builder = services
            .event(Topic::parse(REGISTRY_QUERY_RESPONSE_TOPIC).expect("reserved topic is valid"))
            .event_type("io.amcp.registry.query.response")
            .delivery(DeliveryOptions::Reliable)
            .data(serde_json::to_value(&response).map_err(amcp_events::EventError::from)?);
        if let Some(correlation_id) = event.correlation_id() {
            builder = builder.correlation_id(correlation_id);
        }
        services.publish(builder.build()?).await
    }
}

#[async_trait]
impl EventReactor for RegistryAgent {
    async fn on_event(&self, services: &AgentServices, event: Event) -> AgentResult {
        match event.topic().as_str() {
            REGISTRY_REGISTER_TOPIC => {
                let announcement: RegistrationAnnouncement = event
                    .data_as()
                    .map_err(|err| AgentError::handler(format!("malformed registration: {err}")))?;
                self.upsert(announcement);
                Ok(())
            }
            REGISTRY_HEARTBEAT_TOPIC => {
                let beat: HeartbeatAnnouncement = event
                    .data_as()
                    .map_err(|err| AgentError::handler(format!("malformed heartbeat: {err}")))?;
                self.heartbeat(&beat.agent_id);
                Ok(())
            }
            REGISTRY_DEREGISTER_TOPIC => {
                let beat: HeartbeatAnnouncement = event
                    .data_as()
                    .map_err(|err| AgentError::handler(format!("malformed deregistration: {err}")))?;
                self.deregister(&beat.agent_id);
                Ok(())
            }
            REGISTRY_QUERY_REQUEST_TOPIC => self.answer_query(services, &event).await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl LifecycleHooks for RegistryAgent {
    async fn on_activate(&self, _services: &AgentServices) -> AgentResult {
        let records = Arc::clone(&self.records);
        let config = self.config;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                Self::sweep(&records, &config);
            }
        });
        *self.sweeper.lock().expect("sweeper lock poisoned") = Some(handle);
        Ok(())
    }

    async fn on_deactivate(&self, _services: &AgentServices) -> AgentResult {
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            handle.abort();
        }
        Ok(())
    }

    async fn on_destroy(&self, services: &AgentServices) -> AgentResult {
        self.on_deactivate(services).await
    }
}

impl Mobile for RegistryAgent {}

impl Persistable for RegistryAgent {
    fn capture_state(&self) -> AgentResult<Value> {
        serde_json::to_value(self.records())
            .map_err(|err| AgentError::capture(err.to_string()))
    }

    fn restore_state(&self, state: Value) -> AgentResult {
        let entries: Vec<CapabilityRecord> = serde_json::from_value(state)
            .map_err(|err| AgentError::restore(err.to_string()))?;
        let mut records = self
            .records
            .write()
            .expect("registry records lock poisoned");
        records.clear();
        for record in entries {
            records.insert(record.agent_id.clone(), record);
        }
        Ok(())
    }
}

impl Agent for RegistryAgent {
    fn agent_type(&self) -> &str {
        "registry"
    }

    fn subscriptions(&self) -> Vec<TopicPattern> {
        vec![TopicPattern::parse("system.registry.**").expect("reserved pattern is valid")]
    }
}
