//! Agent context: ownership, routing, lifecycle orchestration.
//!
//! The context owns every agent by identity. Agents reach their context only
//! through [`AgentServices`], which holds weak references, so serialized
//! agent state can never drag the context along.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock as StdRwLock, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use amcp_bus::{
    BusError, CorrelationTracker, EventBroker, EventHandler, HandlerError, HandlerResult,
};
use amcp_events::{Event, EventBuilder, EventError};
use amcp_primitives::{AgentId, ContextId, Topic, TopicPattern};

use crate::agent::{Agent, AgentError, AgentFactoryRegistry, AgentResult};
use crate::config::RuntimeConfig;
use crate::control::{ControlEvent, ControlOutcome};
use crate::lifecycle::{AgentState, LifecycleError, LifecycleEvent, apply_transition};
use crate::mobility::MobilityManager;

/// Result alias for context operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by context operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// An agent with the same identity is already registered.
    #[error("agent {agent_id} is already registered")]
    DuplicateAgent {
        /// The conflicting identity.
        agent_id: AgentId,
    },

    /// The context does not own the referenced agent.
    #[error("agent {agent_id} is not registered in this context")]
    UnknownAgent {
        /// The unknown identity.
        agent_id: AgentId,
    },

    /// A lifecycle transition was rejected; no state change occurred.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// A broker operation failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Envelope construction failed.
    #[error(transparent)]
    Envelope(#[from] EventError),

    /// An agent hook returned an error.
    #[error("agent hook failed: {reason}")]
    Hook {
        /// Human-readable reason.
        reason: String,
    },

    /// The context configuration failed validation.
    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(&'static str),
}

impl RuntimeError {
    pub(crate) fn hook(err: &AgentError) -> Self {
        Self::Hook {
            reason: err.to_string(),
        }
    }
}

/// Per-agent view of the owning context.
///
/// Holds the context only by id and weak lookup; safe to clone into handler
/// closures, never part of serialized agent state.
#[derive(Clone)]
pub struct AgentServices {
    context_id: ContextId,
    agent_id: AgentId,
    source: String,
    broker: Arc<dyn EventBroker>,
    cell: Weak<AgentCell>,
}

impl AgentServices {
    /// Identifier of the hosting context.
    #[must_use]
    pub fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    /// Identity of the agent this handle belongs to.
    #[must_use]
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Starts an envelope builder with source and sender pre-stamped.
    #[must_use]
    pub fn event(&self, topic: Topic) -> EventBuilder {
        Event::builder(topic)
            .source(self.source.clone())
            .sender(self.agent_id.clone())
    }

    /// Publishes an event on the context's bus.
    ///
    /// # Errors
    ///
    /// Propagates broker errors.
    pub async fn publish(&self, event: Event) -> AgentResult {
        self.broker.publish(event).await?;
        Ok(())
    }

    /// Adds a subscription for this agent at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Detached`] when the agent is gone, or propagates
    /// broker errors.
    pub async fn subscribe(&self, pattern: TopicPattern) -> AgentResult {
        let cell = self.cell.upgrade().ok_or(AgentError::Detached)?;
        let newly_added = cell.add_subscription(pattern.clone());
        if newly_added && cell.is_bound() {
            self.broker
                .subscribe(&cell.subscriber_id(), pattern, cell.bridge())
                .await?;
        }
        Ok(())
    }

    /// Removes a runtime subscription for this agent.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Detached`] when the agent is gone, or propagates
    /// broker errors.
    pub async fn unsubscribe(&self, pattern: &TopicPattern) -> AgentResult {
        let cell = self.cell.upgrade().ok_or(AgentError::Detached)?;
        let removed = cell.remove_subscription(pattern);
        if removed && cell.is_bound() {
            self.broker
                .unsubscribe(&cell.subscriber_id(), pattern)
                .await?;
        }
        Ok(())
    }
}

pub(crate) struct AgentCell {
    pub(crate) id: AgentId,
    pub(crate) agent: Arc<dyn Agent>,
    state: StdRwLock<AgentState>,
    /// One event in flight per agent; admin operations take the same lock.
    pub(crate) serial: Mutex<()>,
    pending: StdMutex<VecDeque<Event>>,
    subscriptions: StdMutex<HashSet<TopicPattern>>,
    bound: AtomicBool,
    services: OnceLock<AgentServices>,
    bridge: OnceLock<Arc<AgentBridgeHandler>>,
}

impl AgentCell {
    pub(crate) fn state(&self) -> AgentState {
        *self.state.read().expect("agent state lock poisoned")
    }

    pub(crate) fn transition(&self, event: LifecycleEvent) -> Result<AgentState, LifecycleError> {
        let mut state = self.state.write().expect("agent state lock poisoned");
        let next = apply_transition(&self.id, *state, event)?;
        *state = next;
        Ok(next)
    }

    fn force_state(&self, next: AgentState) {
        *self.state.write().expect("agent state lock poisoned") = next;
    }

    pub(crate) fn buffer(&self, event: Event) {
        self.pending
            .lock()
            .expect("pending queue lock poisoned")
            .push_back(event);
    }

    pub(crate) fn take_pending(&self) -> Vec<Event> {
        self.pending
            .lock()
            .expect("pending queue lock poisoned")
            .drain(..)
            .collect()
    }

    pub(crate) fn subscriber_id(&self) -> String {
        self.id.to_string()
    }

    pub(crate) fn subscription_patterns(&self) -> Vec<TopicPattern> {
        self.subscriptions
            .lock()
            .expect("subscription set lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn add_subscription(&self, pattern: TopicPattern) -> bool {
        self.subscriptions
            .lock()
            .expect("subscription set lock poisoned")
            .insert(pattern)
    }

    fn remove_subscription(&self, pattern: &TopicPattern) -> bool {
        self.subscriptions
            .lock()
            .expect("subscription set lock poisoned")
            .remove(pattern)
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub(crate) fn services(&self) -> &AgentServices {
        self.services
            .get()
            .expect("services are installed at registration")
    }

    fn bridge(&self) -> Arc<dyn EventHandler> {
        let bridge = self
            .bridge
            .get()
            .expect("bridge is installed at registration");
        Arc::clone(bridge) as Arc<dyn EventHandler>
    }
}

/// Routes bus deliveries into the agent, enforcing lifecycle gating and
/// per-agent serialization.
struct AgentBridgeHandler {
    cell: Weak<AgentCell>,
}

#[async_trait]
impl EventHandler for AgentBridgeHandler {
    async fn handle_event(&self, event: Event) -> HandlerResult {
        let Some(cell) = self.cell.upgrade() else {
            return Err(HandlerError::unavailable("agent removed"));
        };

        match cell.state() {
            AgentState::Migrating => {
                cell.buffer(event);
                return Ok(());
            }
            AgentState::Inactive => {
                return Err(HandlerError::unavailable("agent inactive"));
            }
            AgentState::Destroyed => {
                return Err(HandlerError::unavailable("agent destroyed"));
            }
            AgentState::Active => {}
        }

        let _guard = cell.serial.lock().await;
        // Re-check: the state may have changed while we waited on the lock.
        match cell.state() {
            AgentState::Active => cell
                .agent
                .on_event(cell.services(), event)
                .await
                .map_err(|err| HandlerError::failed(err.to_string())),
            AgentState::Migrating => {
                cell.buffer(event);
                Ok(())
            }
            _ => Err(HandlerError::unavailable("agent not active")),
        }
    }
}

pub(crate) struct ContextInner {
    pub(crate) context_id: ContextId,
    pub(crate) broker: Arc<dyn EventBroker>,
    pub(crate) config: RuntimeConfig,
    pub(crate) agents: RwLock<HashMap<AgentId, Arc<AgentCell>>>,
    pub(crate) factories: AgentFactoryRegistry,
    pub(crate) correlations: CorrelationTracker,
    expiry_task: StdMutex<Option<JoinHandle<()>>>,
    pub(crate) mobility: OnceLock<MobilityManager>,
    started: AtomicBool,
}

impl ContextInner {
    pub(crate) async fn cell(&self, agent_id: &AgentId) -> RuntimeResult<Arc<AgentCell>> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownAgent {
                agent_id: agent_id.clone(),
            })
    }

    pub(crate) async fn register_cell(
        &self,
        agent_id: AgentId,
        agent: Arc<dyn Agent>,
    ) -> RuntimeResult<Arc<AgentCell>> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent_id) {
            return Err(RuntimeError::DuplicateAgent { agent_id });
        }

        let subscriptions: HashSet<TopicPattern> = agent.subscriptions().into_iter().collect();
        let cell = Arc::new(AgentCell {
            id: agent_id.clone(),
            agent,
            state: StdRwLock::new(AgentState::Inactive),
            serial: Mutex::new(()),
            pending: StdMutex::new(VecDeque::new()),
            subscriptions: StdMutex::new(subscriptions),
            bound: AtomicBool::new(false),
            services: OnceLock::new(),
            bridge: OnceLock::new(),
        });

        let services = AgentServices {
            context_id: self.context_id.clone(),
            agent_id: agent_id.clone(),
            source: format!("amcp://{}/{}", self.context_id, agent_id.name()),
            broker: Arc::clone(&self.broker),
            cell: Arc::downgrade(&cell),
        };
        let bridge = Arc::new(AgentBridgeHandler {
            cell: Arc::downgrade(&cell),
        });
        cell.services
            .set(services)
            .map_err(|_| RuntimeError::InvalidConfig("services installed twice"))?;
        cell.bridge
            .set(bridge)
            .map_err(|_| RuntimeError::InvalidConfig("bridge installed twice"))?;

        debug!(agent_id = %agent_id, context = %self.context_id, "agent registered");
        agents.insert(agent_id, Arc::clone(&cell));
        Ok(cell)
    }

    pub(crate) async fn bind_subscriptions(&self, cell: &Arc<AgentCell>) -> RuntimeResult<()> {
        if cell.bound.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let subscriber_id = cell.subscriber_id();
        for pattern in cell.subscription_patterns() {
            match self
                .broker
                .subscribe(&subscriber_id, pattern, cell.bridge())
                .await
            {
                Ok(()) | Err(BusError::AlreadySubscribed { .. }) => {}
                Err(err) => {
                    cell.bound.store(false, Ordering::Release);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn unbind_subscriptions(&self, cell: &Arc<AgentCell>) {
        if !cell.bound.swap(false, Ordering::AcqRel) {
            return;
        }
        let subscriber_id = cell.subscriber_id();
        for pattern in cell.subscription_patterns() {
            if let Err(err @ BusError::NotRunning) =
                self.broker.unsubscribe(&subscriber_id, &pattern).await
            {
                debug!(error = %err, "unsubscribe skipped; broker stopped");
                return;
            }
        }
    }

    pub(crate) async fn activate_cell(&self, cell: &Arc<AgentCell>) -> RuntimeResult<()> {
        cell.transition(LifecycleEvent::Activate)?;
        self.bind_subscriptions(cell).await?;
        if let Err(err) = cell.agent.on_activate(cell.services()).await {
            warn!(agent_id = %cell.id, error = %err, "activation hook failed; reverting");
            cell.force_state(AgentState::Inactive);
            return Err(RuntimeError::hook(&err));
        }
        info!(agent_id = %cell.id, context = %self.context_id, "agent activated");
        Ok(())
    }

    pub(crate) async fn deactivate_cell(&self, cell: &Arc<AgentCell>) -> RuntimeResult<()> {
        let _guard = cell.serial.lock().await;
        cell.transition(LifecycleEvent::Deactivate)?;
        if let Err(err) = cell.agent.on_deactivate(cell.services()).await {
            warn!(agent_id = %cell.id, error = %err, "deactivation hook failed");
        }
        Ok(())
    }

    pub(crate) async fn destroy_cell(&self, agent_id: &AgentId) -> RuntimeResult<()> {
        let cell = self.cell(agent_id).await?;
        {
            let _guard = cell.serial.lock().await;
            cell.transition(LifecycleEvent::Destroy)?;
            if let Err(err) = cell.agent.on_destroy(cell.services()).await {
                warn!(agent_id = %cell.id, error = %err, "destroy hook failed");
            }
        }
        self.unbind_subscriptions(&cell).await;
        self.agents.write().await.remove(agent_id);
        info!(agent_id = %agent_id, context = %self.context_id, "agent destroyed");
        Ok(())
    }

    /// Removes an agent that successfully moved to another context.
    pub(crate) async fn remove_migrated(&self, agent_id: &AgentId) -> RuntimeResult<()> {
        let cell = self.cell(agent_id).await?;
        cell.transition(LifecycleEvent::CompleteMigration)?;
        self.unbind_subscriptions(&cell).await;
        self.agents.write().await.remove(agent_id);
        Ok(())
    }

    /// Re-injects events buffered while an agent was MIGRATING.
    pub(crate) fn drain_pending(&self, cell: Arc<AgentCell>) {
        let events = cell.take_pending();
        if events.is_empty() {
            return;
        }
        debug!(agent_id = %cell.id, count = events.len(), "draining buffered events");
        tokio::spawn(async move {
            for event in events {
                let _guard = cell.serial.lock().await;
                if !cell.state().is_active() {
                    // Re-buffer and stop: another migration or shutdown won.
                    cell.buffer(event);
                    continue;
                }
                if let Err(err) = cell.agent.on_event(cell.services(), event).await {
                    warn!(agent_id = %cell.id, error = %err, "buffered event handler failed");
                }
            }
        });
    }
}

/// Process-local host for a set of agents, bound to one event broker.
#[derive(Clone)]
pub struct AgentContext {
    inner: Arc<ContextInner>,
}

impl AgentContext {
    /// Creates a context bound to the supplied broker.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] when the configuration fails
    /// validation.
    pub fn new(
        context_id: ContextId,
        broker: Arc<dyn EventBroker>,
        config: RuntimeConfig,
    ) -> RuntimeResult<Self> {
        config.validate()?;
        let inner = Arc::new(ContextInner {
            context_id,
            broker,
            config,
            agents: RwLock::new(HashMap::new()),
            factories: AgentFactoryRegistry::new(),
            correlations: CorrelationTracker::new(),
            expiry_task: StdMutex::new(None),
            mobility: OnceLock::new(),
            started: AtomicBool::new(false),
        });
        let mobility = MobilityManager::new(Arc::downgrade(&inner));
        inner
            .mobility
            .set(mobility)
            .map_err(|_| RuntimeError::InvalidConfig("mobility installed twice"))?;
        Ok(Self { inner })
    }

    /// Returns the context identifier.
    #[must_use]
    pub fn context_id(&self) -> &ContextId {
        &self.inner.context_id
    }

    /// Returns the bound broker.
    #[must_use]
    pub fn broker(&self) -> Arc<dyn EventBroker> {
        Arc::clone(&self.inner.broker)
    }

    /// Returns the factory registry used to re-instantiate migrated agents.
    #[must_use]
    pub fn factories(&self) -> &AgentFactoryRegistry {
        &self.inner.factories
    }

    /// Returns the correlation tracker owned by this context.
    #[must_use]
    pub fn correlations(&self) -> &CorrelationTracker {
        &self.inner.correlations
    }

    /// Returns the mobility manager.
    #[must_use]
    pub fn mobility(&self) -> &MobilityManager {
        self.inner
            .mobility
            .get()
            .expect("mobility is installed at construction")
    }

    /// Starts background services: the correlation expiry scheduler and, when
    /// enabled, the mobility transport subscriber.
    ///
    /// # Errors
    ///
    /// Propagates broker subscription errors.
    pub async fn start(&self) -> RuntimeResult<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let expiry = self
            .inner
            .correlations
            .spawn_expiry_task(self.inner.config.correlation_cleanup_interval());
        *self
            .inner
            .expiry_task
            .lock()
            .expect("expiry task lock poisoned") = Some(expiry);

        if self.inner.config.mobility().enabled() {
            self.mobility().attach_transport().await?;
        }
        info!(context = %self.inner.context_id, "agent context started");
        Ok(())
    }

    /// Registers an agent under the supplied identity, initially INACTIVE.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::DuplicateAgent`] when the identity is taken.
    pub async fn register_agent(
        &self,
        agent_id: AgentId,
        agent: Arc<dyn Agent>,
    ) -> RuntimeResult<()> {
        self.inner.register_cell(agent_id, agent).await?;
        Ok(())
    }

    /// Unregisters an INACTIVE agent without running destroy hooks.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Lifecycle`] when the agent is not INACTIVE.
    pub async fn unregister_agent(&self, agent_id: &AgentId) -> RuntimeResult<()> {
        let cell = self.inner.cell(agent_id).await?;
        if cell.state() != AgentState::Inactive {
            return Err(LifecycleError::InvalidTransition {
                agent_id: agent_id.clone(),
                from: cell.state(),
                event: LifecycleEvent::Destroy,
            }
            .into());
        }
        self.inner.unbind_subscriptions(&cell).await;
        self.inner.agents.write().await.remove(agent_id);
        Ok(())
    }

    /// Activates an agent: transitions to ACTIVE, binds its subscriptions,
    /// and runs `on_activate`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Lifecycle`] when the transition is not
    /// permitted, or [`RuntimeError::Hook`] when the activation hook fails
    /// (state reverts to INACTIVE).
    pub async fn activate_agent(&self, agent_id: &AgentId) -> RuntimeResult<()> {
        let cell = self.inner.cell(agent_id).await?;
        self.inner.activate_cell(&cell).await
    }

    /// Deactivates an agent, keeping its subscriptions for a later
    /// activation.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Lifecycle`] when the agent is not ACTIVE.
    pub async fn deactivate_agent(&self, agent_id: &AgentId) -> RuntimeResult<()> {
        let cell = self.inner.cell(agent_id).await?;
        self.inner.deactivate_cell(&cell).await
    }

    /// Destroys an agent permanently, running `on_destroy` first.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Lifecycle`] when the agent is MIGRATING.
    pub async fn destroy_agent(&self, agent_id: &AgentId) -> RuntimeResult<()> {
        self.inner.destroy_cell(agent_id).await
    }

    /// Returns the lifecycle state of a registered agent.
    pub async fn agent_state(&self, agent_id: &AgentId) -> Option<AgentState> {
        self.inner
            .agents
            .read()
            .await
            .get(agent_id)
            .map(|cell| cell.state())
    }

    /// Returns the identities of all registered agents.
    pub async fn agent_ids(&self) -> Vec<AgentId> {
        self.inner.agents.read().await.keys().cloned().collect()
    }

    /// Returns `true` when the context owns the agent.
    pub async fn owns(&self, agent_id: &AgentId) -> bool {
        self.inner.agents.read().await.contains_key(agent_id)
    }

    /// Publishes an event on the bound broker.
    ///
    /// # Errors
    ///
    /// Propagates broker errors.
    pub async fn publish(&self, event: Event) -> RuntimeResult<()> {
        self.inner.broker.publish(event).await?;
        Ok(())
    }

    /// Adds a subscription for a registered agent.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::UnknownAgent`] or propagates broker errors.
    pub async fn subscribe(&self, agent_id: &AgentId, pattern: TopicPattern) -> RuntimeResult<()> {
        let cell = self.inner.cell(agent_id).await?;
        let newly_added = cell.add_subscription(pattern.clone());
        if newly_added && cell.is_bound() {
            self.inner
                .broker
                .subscribe(&cell.subscriber_id(), pattern, cell.bridge())
                .await?;
        }
        Ok(())
    }

    /// Removes a subscription held by a registered agent.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::UnknownAgent`] or propagates broker errors.
    pub async fn unsubscribe(
        &self,
        agent_id: &AgentId,
        pattern: &TopicPattern,
    ) -> RuntimeResult<()> {
        let cell = self.inner.cell(agent_id).await?;
        let removed = cell.remove_subscription(pattern);
        if removed && cell.is_bound() {
            self.inner
                .broker
                .unsubscribe(&cell.subscriber_id(), pattern)
                .await?;
        }
        Ok(())
    }

    /// Delivers an operational command to an agent with priority over queued
    /// data events, still serialized against them.
    ///
    /// # Errors
    ///
    /// Propagates lifecycle and mobility errors from the executed command.
    pub async fn send_control_event(
        &self,
        agent_id: &AgentId,
        control: ControlEvent,
    ) -> RuntimeResult<ControlOutcome> {
        match control {
            ControlEvent::Ping => {
                let cell = self.inner.cell(agent_id).await?;
                let _guard = cell.serial.lock().await;
                Ok(ControlOutcome::Pong { state: cell.state() })
            }
            ControlEvent::Drain => {
                self.deactivate_agent(agent_id).await?;
                Ok(ControlOutcome::Drained)
            }
            ControlEvent::Shutdown => {
                self.destroy_agent(agent_id).await?;
                Ok(ControlOutcome::ShutDown)
            }
            ControlEvent::Migrate { destination } => {
                self.mobility()
                    .dispatch(agent_id, destination.clone())
                    .await
                    .map_err(|err| RuntimeError::Hook {
                        reason: err.to_string(),
                    })?;
                Ok(ControlOutcome::Migrated { destination })
            }
        }
    }

    /// Drains the context: deactivates agents, cancels pending correlations,
    /// and stops the broker, bounded by the configured grace period.
    ///
    /// # Errors
    ///
    /// Propagates broker stop errors; a grace-period overrun is logged and
    /// not an error.
    pub async fn shutdown(&self) -> RuntimeResult<()> {
        let grace = self.inner.config.shutdown_grace();
        info!(context = %self.inner.context_id, "context shutdown initiated");

        let inner = Arc::clone(&self.inner);
        let drain = async move {
            let ids: Vec<AgentId> = inner.agents.read().await.keys().cloned().collect();
            for agent_id in ids {
                if let Ok(cell) = inner.cell(&agent_id).await {
                    if cell.state().is_active() {
                        if let Err(err) = inner.deactivate_cell(&cell).await {
                            warn!(agent_id = %agent_id, error = %err, "drain deactivation failed");
                        }
                    }
                }
            }
            inner.correlations.cancel_all().await;
            inner.broker.stop().await
        };

        match timeout(grace, drain).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(context = %self.inner.context_id, "shutdown grace period exceeded; forcing");
            }
        }

        if let Some(handle) = self
            .inner
            .expiry_task
            .lock()
            .expect("expiry task lock poisoned")
            .take()
        {
            handle.abort();
        }
        self.inner.started.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use serde_json::json;

    use amcp_bus::InMemoryBroker;

    struct CountingAgent {
        seen: AtomicU32,
        in_flight: AtomicU32,
        overlap: AtomicBool,
    }

    impl CountingAgent {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: AtomicU32::new(0),
                in_flight: AtomicU32::new(0),
                overlap: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl crate::agent::EventReactor for CountingAgent {
        async fn on_event(&self, _services: &AgentServices, _event: Event) -> AgentResult {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlap.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl crate::agent::LifecycleHooks for CountingAgent {}
    impl crate::agent::Mobile for CountingAgent {}
    impl crate::agent::Persistable for CountingAgent {}

    impl Agent for CountingAgent {
        fn agent_type(&self) -> &str {
            "counting"
        }

        fn subscriptions(&self) -> Vec<TopicPattern> {
            vec![TopicPattern::parse("count.*").unwrap()]
        }
    }

    async fn fixture() -> (AgentContext, Arc<dyn EventBroker>) {
        let broker: Arc<dyn EventBroker> = Arc::new(InMemoryBroker::with_defaults());
        broker.start().await.unwrap();
        let context = AgentContext::new(
            ContextId::new("testctx").unwrap(),
            Arc::clone(&broker),
            RuntimeConfig::default(),
        )
        .unwrap();
        context.start().await.unwrap();
        (context, broker)
    }

    fn data_event(topic: &str) -> Event {
        Event::builder(Topic::parse(topic).unwrap())
            .event_type("io.amcp.test")
            .source("amcp://test")
            .data(json!({"n": 1}))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn events_reach_only_active_agents() {
        let (context, broker) = fixture().await;
        let agent = CountingAgent::new();
        let agent_id = AgentId::new("counter", "test").unwrap();
        context
            .register_agent(agent_id.clone(), Arc::clone(&agent) as Arc<dyn Agent>)
            .await
            .unwrap();

        // Inactive: no subscriptions bound yet, nothing arrives.
        broker.publish(data_event("count.up")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(agent.seen.load(Ordering::SeqCst), 0);

        context.activate_agent(&agent_id).await.unwrap();
        broker.publish(data_event("count.up")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(agent.seen.load(Ordering::SeqCst), 1);

        context.deactivate_agent(&agent_id).await.unwrap();
        broker.publish(data_event("count.up")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(agent.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_agent_handlers_are_serialized() {
        let (context, broker) = fixture().await;
        let agent = CountingAgent::new();
        let agent_id = AgentId::new("serial", "test").unwrap();
        context
            .register_agent(agent_id.clone(), Arc::clone(&agent) as Arc<dyn Agent>)
            .await
            .unwrap();
        context.activate_agent(&agent_id).await.unwrap();

        for _ in 0..10 {
            broker.publish(data_event("count.up")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(agent.seen.load(Ordering::SeqCst), 10);
        assert!(
            !agent.overlap.load(Ordering::SeqCst),
            "handlers must never overlap for one agent"
        );
    }

    #[tokio::test]
    async fn double_activation_is_rejected_without_state_change() {
        let (context, _broker) = fixture().await;
        let agent_id = AgentId::new("once", "test").unwrap();
        context
            .register_agent(agent_id.clone(), CountingAgent::new() as Arc<dyn Agent>)
            .await
            .unwrap();
        context.activate_agent(&agent_id).await.unwrap();

        let err = context
            .activate_agent(&agent_id)
            .await
            .expect_err("already active");
        assert!(matches!(err, RuntimeError::Lifecycle(_)));
        assert_eq!(
            context.agent_state(&agent_id).await,
            Some(AgentState::Active)
        );
    }

    #[tokio::test]
    async fn control_events_report_state_and_drain() {
        let (context, _broker) = fixture().await;
        let agent_id = AgentId::new("ctl", "test").unwrap();
        context
            .register_agent(agent_id.clone(), CountingAgent::new() as Arc<dyn Agent>)
            .await
            .unwrap();
        context.activate_agent(&agent_id).await.unwrap();

        let pong = context
            .send_control_event(&agent_id, ControlEvent::Ping)
            .await
            .unwrap();
        assert_eq!(
            pong,
            ControlOutcome::Pong {
                state: AgentState::Active
            }
        );

        let drained = context
            .send_control_event(&agent_id, ControlEvent::Drain)
            .await
            .unwrap();
        assert_eq!(drained, ControlOutcome::Drained);
        assert_eq!(
            context.agent_state(&agent_id).await,
            Some(AgentState::Inactive)
        );

        let shut = context
            .send_control_event(&agent_id, ControlEvent::Shutdown)
            .await
            .unwrap();
        assert_eq!(shut, ControlOutcome::ShutDown);
        assert!(!context.owns(&agent_id).await);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (context, _broker) = fixture().await;
        let agent_id = AgentId::new("dup", "test").unwrap();
        context
            .register_agent(agent_id.clone(), CountingAgent::new() as Arc<dyn Agent>)
            .await
            .unwrap();
        let err = context
            .register_agent(agent_id, CountingAgent::new() as Arc<dyn Agent>)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, RuntimeError::DuplicateAgent { .. }));
    }

    #[tokio::test]
    async fn dynamic_subscriptions_take_effect_while_active() {
        let (context, broker) = fixture().await;
        let agent = CountingAgent::new();
        let agent_id = AgentId::new("dyn", "test").unwrap();
        context
            .register_agent(agent_id.clone(), Arc::clone(&agent) as Arc<dyn Agent>)
            .await
            .unwrap();
        context.activate_agent(&agent_id).await.unwrap();

        context
            .subscribe(&agent_id, TopicPattern::parse("extra.**").unwrap())
            .await
            .unwrap();
        broker.publish(data_event("extra.topic.here")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(agent.seen.load(Ordering::SeqCst), 1);

        context
            .unsubscribe(&agent_id, &TopicPattern::parse("extra.**").unwrap())
            .await
            .unwrap();
        broker.publish(data_event("extra.topic.here")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(agent.seen.load(Ordering::SeqCst), 1);
    }
}
