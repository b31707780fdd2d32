//! Strong mobility: move, copy, recall, and replicate agents across
//! contexts.
//!
//! Tickets travel over the same bus the mesh already trusts, RELIABLE, on
//! the reserved `system.mobility.**` tree. Each context subscribes to its own
//! `system.mobility.<context>.*` branch for tickets, acknowledgements, and
//! retract requests.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use amcp_bus::{CorrelationError, EventHandler, HandlerError, HandlerResult};
use amcp_events::{DeliveryOptions, Event};
use amcp_primitives::{AgentId, ContextId, Topic, TopicPattern};

use crate::context::{AgentCell, ContextInner, RuntimeError};
use crate::lifecycle::LifecycleEvent;

use async_trait::async_trait;

/// Reserved topic announcing a completed transfer.
pub const MOBILITY_COMPLETED_TOPIC: &str = "system.mobility.completed";
/// Reserved topic announcing a failed transfer.
pub const MOBILITY_FAILED_TOPIC: &str = "system.mobility.failed";
/// Topic announcing an agent re-binding at its destination.
pub const AGENT_MIGRATED_TOPIC: &str = "agent.migrated";

/// Result alias for mobility operations.
pub type MobilityResult<T> = Result<T, MobilityError>;

/// Errors surfaced by mobility operations.
#[derive(Debug, Error)]
pub enum MobilityError {
    /// Mobility is disabled on this context.
    #[error("mobility is disabled on this context")]
    Disabled,

    /// The owning context has been dropped.
    #[error("mobility manager is detached from its context")]
    Detached,

    /// The destination refused the transfer.
    #[error("destination rejected transfer: {reason}")]
    Rejected {
        /// Reason reported by the destination.
        reason: String,
    },

    /// The transfer failed; the source agent was rolled back to ACTIVE.
    #[error("migration of agent {agent_id} failed: {reason}")]
    Failed {
        /// The agent whose transfer failed.
        agent_id: AgentId,
        /// Human-readable reason.
        reason: String,
    },

    /// A context operation failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// The four mobility verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Move the agent; the source forgets it.
    Dispatch,
    /// Copy the agent; the source stays ACTIVE, the copy gets a fresh
    /// instance id.
    Clone,
    /// A dispatch triggered by the destination recalling the agent.
    Retract,
}

/// State-transfer record emitted by the source and consumed by the
/// destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationTicket {
    /// Correlates ticket and acknowledgement.
    pub transfer_id: String,
    /// Identity of the travelling agent.
    pub agent_id: AgentId,
    /// Factory type tag used to re-instantiate the agent.
    pub agent_type: String,
    /// Context emitting the ticket.
    pub source_context: ContextId,
    /// Context expected to materialize the agent.
    pub destination_context: ContextId,
    /// Transfer verb.
    pub mode: MigrationMode,
    /// Captured agent state, opaque to the runtime.
    pub serialized_state: Value,
    /// Events buffered at the source while the agent was MIGRATING.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_events: Vec<Event>,
    /// Bearer token verified by destinations that require one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TransferAck {
    transfer_id: String,
    accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RetractRequest {
    transfer_id: String,
    agent_id: AgentId,
    requester: ContextId,
}

fn ticket_topic(context: &ContextId) -> Topic {
    Topic::parse(format!("system.mobility.{context}.ticket")).expect("reserved topic is valid")
}

fn ack_topic(context: &ContextId) -> Topic {
    Topic::parse(format!("system.mobility.{context}.ack")).expect("reserved topic is valid")
}

fn retract_topic(context: &ContextId) -> Topic {
    Topic::parse(format!("system.mobility.{context}.retract")).expect("reserved topic is valid")
}

fn mobility_source(context: &ContextId) -> String {
    format!("amcp://{context}/mobility")
}

/// Orchestrates agent transfers for one context.
pub struct MobilityManager {
    context: Weak<ContextInner>,
}

impl MobilityManager {
    pub(crate) fn new(context: Weak<ContextInner>) -> Self {
        Self { context }
    }

    fn inner(&self) -> MobilityResult<Arc<ContextInner>> {
        self.context.upgrade().ok_or(MobilityError::Detached)
    }

    fn ensure_enabled(inner: &ContextInner) -> MobilityResult<()> {
        if inner.config.mobility().enabled() {
            Ok(())
        } else {
            Err(MobilityError::Disabled)
        }
    }

    /// Subscribes the context to its mobility transport branch.
    pub(crate) async fn attach_transport(&self) -> Result<(), RuntimeError> {
        let inner = self.context.upgrade().ok_or(RuntimeError::InvalidConfig(
            "mobility transport attached on dropped context",
        ))?;
        let pattern =
            TopicPattern::parse(format!("system.mobility.{}.*", inner.context_id))
                .expect("reserved pattern is valid");
        let handler: Arc<dyn EventHandler> = Arc::new(MobilityTransportHandler {
            context: self.context.clone(),
        });
        inner
            .broker
            .subscribe(&format!("mobility-{}", inner.context_id), pattern, handler)
            .await?;
        Ok(())
    }

    /// Moves an agent to another context: code reference plus captured state.
    ///
    /// # Errors
    ///
    /// Returns [`MobilityError::Failed`] or [`MobilityError::Rejected`] after
    /// rolling the source agent back to ACTIVE with no lost events.
    pub async fn dispatch(&self, agent_id: &AgentId, destination: ContextId) -> MobilityResult<()> {
        let inner = self.inner()?;
        Self::ensure_enabled(&inner)?;
        run_dispatch(
            &inner,
            agent_id,
            destination,
            Uuid::new_v4().to_string(),
            MigrationMode::Dispatch,
        )
        .await
    }

    /// Copies an agent to another context. The source stays ACTIVE; the
    /// destination mints a fresh instance id which is returned.
    ///
    /// # Errors
    ///
    /// Returns [`MobilityError::Rejected`] or [`MobilityError::Failed`]; the
    /// source agent is untouched in every failure mode.
    pub async fn clone_agent(
        &self,
        agent_id: &AgentId,
        destination: ContextId,
    ) -> MobilityResult<AgentId> {
        let inner = self.inner()?;
        Self::ensure_enabled(&inner)?;
        let cell = inner.cell(agent_id).await?;
        if !cell.state().is_active() {
            return Err(MobilityError::Failed {
                agent_id: agent_id.clone(),
                reason: "only ACTIVE agents can be cloned".into(),
            });
        }

        let state = {
            let _guard = cell.serial.lock().await;
            cell.agent.capture_state().map_err(|err| MobilityError::Failed {
                agent_id: agent_id.clone(),
                reason: err.to_string(),
            })?
        };

        let transfer_id = Uuid::new_v4().to_string();
        let ticket = MigrationTicket {
            transfer_id: transfer_id.clone(),
            agent_id: agent_id.clone(),
            agent_type: cell.agent.agent_type().to_owned(),
            source_context: inner.context_id.clone(),
            destination_context: destination.clone(),
            mode: MigrationMode::Clone,
            serialized_state: state,
            pending_events: Vec::new(),
            auth_token: inner.config.mobility().auth_token().map(str::to_owned),
        };

        let ack = send_ticket_and_await(&inner, ticket).await.map_err(|reason| {
            MobilityError::Failed {
                agent_id: agent_id.clone(),
                reason,
            }
        })?;
        if !ack.accepted {
            return Err(MobilityError::Rejected {
                reason: ack.reason.unwrap_or_else(|| "unspecified".into()),
            });
        }
        let clone_id = ack.agent_id.ok_or_else(|| MobilityError::Rejected {
            reason: "destination omitted the clone identity".into(),
        })?;
        emit_lifecycle_event(
            &inner,
            MOBILITY_COMPLETED_TOPIC,
            "io.amcp.mobility.completed",
            agent_id,
            &destination,
            MigrationMode::Clone,
            None,
        )
        .await;
        Ok(clone_id)
    }

    /// Recalls a previously dispatched agent back into this context.
    ///
    /// # Errors
    ///
    /// Returns [`MobilityError::Rejected`] when the remote context refuses,
    /// or [`MobilityError::Failed`] on timeout.
    pub async fn retract(&self, agent_id: &AgentId, from: ContextId) -> MobilityResult<()> {
        let inner = self.inner()?;
        Self::ensure_enabled(&inner)?;

        let transfer_id = Uuid::new_v4().to_string();
        let pending = inner
            .correlations
            .register(
                transfer_id.clone(),
                Some(agent_id.clone()),
                std::collections::BTreeMap::new(),
                inner.config.mobility().timeout(),
            )
            .await
            .map_err(|err| MobilityError::Failed {
                agent_id: agent_id.clone(),
                reason: err.to_string(),
            })?;

        let request = RetractRequest {
            transfer_id: transfer_id.clone(),
            agent_id: agent_id.clone(),
            requester: inner.context_id.clone(),
        };
        let event = Event::builder(retract_topic(&from))
            .event_type("io.amcp.mobility.retract")
            .source(mobility_source(&inner.context_id))
            .correlation_id(transfer_id)
            .delivery(DeliveryOptions::Reliable)
            .data(serde_json::to_value(&request).expect("retract request serializes"))
            .build()
            .map_err(RuntimeError::from)?;
        inner.broker.publish(event).await.map_err(RuntimeError::from)?;

        let outcome = pending.outcome().await.map_err(|err| match err {
            CorrelationError::Timeout { .. } => MobilityError::Failed {
                agent_id: agent_id.clone(),
                reason: "retract timed out".into(),
            },
            other => MobilityError::Failed {
                agent_id: agent_id.clone(),
                reason: other.to_string(),
            },
        })?;

        let accepted = outcome
            .get("accepted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if accepted {
            Ok(())
        } else {
            Err(MobilityError::Rejected {
                reason: outcome
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_owned(),
            })
        }
    }

    /// Issues a clone to each listed context, gathering per-context results.
    /// One failing destination never cancels the others.
    pub async fn replicate(
        &self,
        agent_id: &AgentId,
        destinations: &[ContextId],
    ) -> Vec<(ContextId, MobilityResult<AgentId>)> {
        let clones = destinations.iter().map(|destination| async {
            (
                destination.clone(),
                self.clone_agent(agent_id, destination.clone()).await,
            )
        });
        futures::future::join_all(clones).await
    }
}

async fn send_ticket_and_await(
    inner: &Arc<ContextInner>,
    ticket: MigrationTicket,
) -> Result<TransferAck, String> {
    let pending = inner
        .correlations
        .register(
            ticket.transfer_id.clone(),
            Some(ticket.agent_id.clone()),
            std::collections::BTreeMap::new(),
            inner.config.mobility().timeout(),
        )
        .await
        .map_err(|err| err.to_string())?;

    let event = Event::builder(ticket_topic(&ticket.destination_context))
        .event_type("io.amcp.mobility.ticket")
        .source(mobility_source(&inner.context_id))
        .correlation_id(ticket.transfer_id.clone())
        .delivery(DeliveryOptions::Reliable)
        .data(serde_json::to_value(&ticket).map_err(|err| err.to_string())?)
        .build()
        .map_err(|err| err.to_string())?;

    inner
        .broker
        .publish(event)
        .await
        .map_err(|err| err.to_string())?;

    let value = pending.outcome().await.map_err(|err| match err {
        CorrelationError::Timeout { .. } => "transfer acknowledgement timed out".to_owned(),
        other => other.to_string(),
    })?;
    serde_json::from_value(value).map_err(|err| format!("malformed acknowledgement: {err}"))
}

async fn run_dispatch(
    inner: &Arc<ContextInner>,
    agent_id: &AgentId,
    destination: ContextId,
    transfer_id: String,
    mode: MigrationMode,
) -> MobilityResult<()> {
    let cell = inner.cell(agent_id).await?;
    cell.transition(LifecycleEvent::BeginMigration)
        .map_err(RuntimeError::from)?;

    // Hooks and capture run serialized against any in-flight event.
    let capture = {
        let _guard = cell.serial.lock().await;
        match cell
            .agent
            .on_before_migration(cell.services(), &destination)
            .await
        {
            Ok(()) => cell.agent.capture_state(),
            Err(err) => Err(err),
        }
    };
    let serialized_state = match capture {
        Ok(state) => state,
        Err(err) => {
            let reason = err.to_string();
            roll_back(inner, &cell, &destination, &reason).await;
            return Err(MobilityError::Failed {
                agent_id: agent_id.clone(),
                reason,
            });
        }
    };

    let ticket = MigrationTicket {
        transfer_id,
        agent_id: agent_id.clone(),
        agent_type: cell.agent.agent_type().to_owned(),
        source_context: inner.context_id.clone(),
        destination_context: destination.clone(),
        mode,
        serialized_state,
        pending_events: cell.take_pending(),
        auth_token: inner.config.mobility().auth_token().map(str::to_owned),
    };

    match send_ticket_and_await(inner, ticket).await {
        Ok(ack) if ack.accepted => {
            inner.remove_migrated(agent_id).await?;
            // Events that slipped in after the ticket was cut are re-published;
            // the destination's re-bound subscriptions pick them up.
            for event in cell.take_pending() {
                if let Err(err) = inner.broker.publish(event).await {
                    warn!(agent_id = %agent_id, error = %err, "residual event republish failed");
                }
            }
            emit_lifecycle_event(
                inner,
                MOBILITY_COMPLETED_TOPIC,
                "io.amcp.mobility.completed",
                agent_id,
                &destination,
                mode,
                None,
            )
            .await;
            info!(agent_id = %agent_id, destination = %destination, "agent dispatched");
            Ok(())
        }
        Ok(ack) => {
            let reason = ack.reason.unwrap_or_else(|| "unspecified".into());
            roll_back(inner, &cell, &destination, &reason).await;
            Err(MobilityError::Rejected { reason })
        }
        Err(reason) => {
            roll_back(inner, &cell, &destination, &reason).await;
            Err(MobilityError::Failed {
                agent_id: agent_id.clone(),
                reason,
            })
        }
    }
}

async fn roll_back(
    inner: &Arc<ContextInner>,
    cell: &Arc<AgentCell>,
    destination: &ContextId,
    reason: &str,
) {
    warn!(agent_id = %cell.id, destination = %destination, reason, "dispatch failed; rolling back");
    if let Err(err) = cell.transition(LifecycleEvent::RollBack) {
        warn!(agent_id = %cell.id, error = %err, "rollback transition rejected");
        return;
    }
    inner.drain_pending(Arc::clone(cell));
    emit_lifecycle_event(
        inner,
        MOBILITY_FAILED_TOPIC,
        "io.amcp.mobility.failed",
        &cell.id,
        destination,
        MigrationMode::Dispatch,
        Some(reason),
    )
    .await;
}

#[allow(clippy::too_many_arguments)]
async fn emit_lifecycle_event(
    inner: &Arc<ContextInner>,
    topic: &str,
    event_type: &str,
    agent_id: &AgentId,
    destination: &ContextId,
    mode: MigrationMode,
    reason: Option<&str>,
) {
    let mut data = json!({
        "agentId": agent_id.to_string(),
        "sourceContext": inner.context_id.as_str(),
        "destinationContext": destination.as_str(),
        "mode": mode,
    });
    if let (Some(reason), Some(object)) = (reason, data.as_object_mut()) {
        object.insert("reason".into(), Value::String(reason.to_owned()));
    }
    let event = Event::builder(Topic::parse(topic).expect("reserved topic is valid"))
        .event_type(event_type)
        .source(mobility_source(&inner.context_id))
        .data(data)
        .build()
        .expect("mobility lifecycle envelope is valid");
    if let Err(err) = inner.broker.publish(event).await {
        debug!(error = %err, "mobility lifecycle event not published");
    }
}

struct MobilityTransportHandler {
    context: Weak<ContextInner>,
}

#[async_trait]
impl EventHandler for MobilityTransportHandler {
    async fn handle_event(&self, event: Event) -> HandlerResult {
        let Some(inner) = self.context.upgrade() else {
            return Err(HandlerError::unavailable("context dropped"));
        };
        let branch = event.topic().segments().last().unwrap_or_default().to_owned();
        match branch.as_str() {
            "ticket" => handle_ticket(&inner, &event).await,
            "ack" => {
                if let (Some(correlation_id), Some(data)) = (event.correlation_id(), event.data()) {
                    inner
                        .correlations
                        .record_response(correlation_id, data.clone())
                        .await;
                }
                Ok(())
            }
            "retract" => {
                match event.data_as::<RetractRequest>() {
                    Ok(request) => {
                        // Run in the background so the transport lane stays
                        // free for the acknowledgement round trip.
                        tokio::spawn(handle_retract(Arc::clone(&inner), request));
                    }
                    Err(err) => {
                        warn!(error = %err, "malformed retract request dropped");
                    }
                }
                Ok(())
            }
            other => {
                debug!(branch = other, "unknown mobility branch ignored");
                Ok(())
            }
        }
    }
}

async fn send_ack(
    inner: &Arc<ContextInner>,
    ticket: &MigrationTicket,
    accepted: bool,
    agent_id: Option<AgentId>,
    reason: Option<String>,
) {
    let ack = TransferAck {
        transfer_id: ticket.transfer_id.clone(),
        accepted,
        agent_id,
        reason,
    };
    let payload = serde_json::to_value(&ack).expect("acknowledgement serializes");
    // A retract requester waits locally on the same transfer id; resolve it
    // before the wire ack so failures propagate promptly.
    inner
        .correlations
        .record_response(&ticket.transfer_id, payload.clone())
        .await;
    let event = Event::builder(ack_topic(&ticket.source_context))
        .event_type("io.amcp.mobility.ack")
        .source(mobility_source(&inner.context_id))
        .correlation_id(ticket.transfer_id.clone())
        .delivery(DeliveryOptions::Reliable)
        .data(payload)
        .build()
        .expect("acknowledgement envelope is valid");
    if let Err(err) = inner.broker.publish(event).await {
        warn!(error = %err, "transfer acknowledgement not published");
    }
}

async fn handle_ticket(inner: &Arc<ContextInner>, event: &Event) -> HandlerResult {
    let ticket: MigrationTicket = match event.data_as() {
        Ok(ticket) => ticket,
        Err(err) => {
            warn!(error = %err, "malformed migration ticket dropped");
            return Ok(());
        }
    };
    if ticket.destination_context != inner.context_id {
        // Misrouted ticket; leave it for the addressed context.
        return Ok(());
    }

    if let Some(expected) = inner.config.mobility().auth_token() {
        if ticket.auth_token.as_deref() != Some(expected) {
            send_ack(inner, &ticket, false, None, Some("authentication failed".into())).await;
            return Ok(());
        }
    }

    let Some(factory) = inner.factories.get(&ticket.agent_type) else {
        send_ack(
            inner,
            &ticket,
            false,
            None,
            Some(format!("no factory for agent type `{}`", ticket.agent_type)),
        )
        .await;
        return Ok(());
    };

    let agent = factory.create();
    if let Err(err) = agent.restore_state(ticket.serialized_state.clone()) {
        send_ack(inner, &ticket, false, None, Some(err.to_string())).await;
        return Ok(());
    }

    let local_id = match ticket.mode {
        MigrationMode::Clone => ticket.agent_id.clone_instance(),
        MigrationMode::Dispatch | MigrationMode::Retract => ticket.agent_id.clone(),
    };

    let cell = match inner.register_cell(local_id.clone(), agent).await {
        Ok(cell) => cell,
        Err(err) => {
            send_ack(inner, &ticket, false, None, Some(err.to_string())).await;
            return Ok(());
        }
    };

    // Re-bind subscriptions before the after-migration hook runs.
    if let Err(err) = inner.bind_subscriptions(&cell).await {
        let _ = inner.agents.write().await.remove(&local_id);
        send_ack(inner, &ticket, false, None, Some(err.to_string())).await;
        return Ok(());
    }

    if let Err(err) = cell
        .agent
        .on_after_migration(cell.services(), &ticket.source_context)
        .await
    {
        inner.unbind_subscriptions(&cell).await;
        let _ = inner.agents.write().await.remove(&local_id);
        send_ack(inner, &ticket, false, None, Some(err.to_string())).await;
        return Ok(());
    }

    let migrated = Event::builder(Topic::parse(AGENT_MIGRATED_TOPIC).expect("valid topic"))
        .event_type("io.amcp.agent.migrated")
        .source(mobility_source(&inner.context_id))
        .correlation_id(ticket.transfer_id.clone())
        .data(json!({
            "agentId": local_id.to_string(),
            "sourceContext": ticket.source_context.as_str(),
            "destinationContext": inner.context_id.as_str(),
            "mode": ticket.mode,
        }))
        .build()
        .expect("migrated envelope is valid");
    if let Err(err) = inner.broker.publish(migrated).await {
        debug!(error = %err, "agent.migrated event not published");
    }

    if let Err(err) = inner.activate_cell(&cell).await {
        inner.unbind_subscriptions(&cell).await;
        let _ = inner.agents.write().await.remove(&local_id);
        send_ack(inner, &ticket, false, None, Some(err.to_string())).await;
        return Ok(());
    }

    // Events buffered at the source drain through the normal handler path.
    for pending in ticket.pending_events.clone() {
        cell.buffer(pending);
    }
    inner.drain_pending(Arc::clone(&cell));

    send_ack(inner, &ticket, true, Some(local_id), None).await;
    Ok(())
}

async fn handle_retract(inner: Arc<ContextInner>, request: RetractRequest) {
    let result = run_dispatch(
        &inner,
        &request.agent_id,
        request.requester.clone(),
        request.transfer_id.clone(),
        MigrationMode::Retract,
    )
    .await;
    if let Err(err) = result {
        warn!(agent_id = %request.agent_id, error = %err, "retract-triggered dispatch failed");
        // Tell the requester directly; its ticket never arrives.
        let ack = TransferAck {
            transfer_id: request.transfer_id,
            accepted: false,
            agent_id: None,
            reason: Some(err.to_string()),
        };
        let event = Event::builder(ack_topic(&request.requester))
            .event_type("io.amcp.mobility.ack")
            .source(mobility_source(&inner.context_id))
            .correlation_id(ack.transfer_id.clone())
            .delivery(DeliveryOptions::Reliable)
            .data(serde_json::to_value(&ack).expect("acknowledgement serializes"))
            .build()
            .expect("acknowledgement envelope is valid");
        if let Err(err) = inner.broker.publish(event).await {
            warn!(error = %err, "retract rejection not published");
        }
    }
}
