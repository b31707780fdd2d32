//! Bidirectional event translation and the synchronous request path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use amcp_bus::{
    BusError, CorrelationError, CorrelationTracker, EventBroker, EventHandler, HandlerError,
    HandlerResult,
};
use amcp_events::{DeliveryOptions, Event, EventError};
use amcp_primitives::{Topic, TopicPattern};

use async_trait::async_trait;

use crate::wire::{A2aMessage, A2aMessageType};

/// Protocol version stamped on every outbound call.
pub const A2A_VERSION: &str = "1.0";

const CORRELATION_HEADER: &str = "X-AMCP-Correlation-ID";
const VERSION_HEADER: &str = "A2A-Version";

/// Result alias for bridge operations.
pub type A2aResult<T> = Result<T, A2aError>;

/// Errors surfaced by the bridge.
#[derive(Debug, Error)]
pub enum A2aError {
    /// The external service answered with a non-2xx status or an unparseable
    /// body.
    #[error("a2a protocol error: {reason}")]
    Protocol {
        /// Human-readable reason.
        reason: String,
    },

    /// The external service could not be reached.
    #[error("a2a transport error: {reason}")]
    Transport {
        /// Human-readable reason.
        reason: String,
    },

    /// No matching response arrived before the deadline.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// Internal envelope construction failed.
    #[error(transparent)]
    Envelope(#[from] EventError),

    /// Internal bus publication failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The bridge configuration is invalid.
    #[error("invalid bridge configuration: {reason}")]
    Configuration {
        /// Human-readable reason.
        reason: String,
    },
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct A2aBridgeConfig {
    endpoint: String,
    bearer_token: Option<String>,
    request_timeout: Duration,
}

impl A2aBridgeConfig {
    /// Creates a configuration for the external endpoint base URL.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer_token: None,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Installs a bearer token passed through on every call.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Sets the synchronous request deadline.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn validate(&self) -> A2aResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(A2aError::Configuration {
                reason: "endpoint cannot be empty".into(),
            });
        }
        Ok(())
    }
}

/// Translates between internal events and the external A2A protocol.
pub struct A2aBridge {
    http: reqwest::Client,
    config: A2aBridgeConfig,
    broker: Arc<dyn EventBroker>,
    tracker: CorrelationTracker,
    source: String,
}

impl A2aBridge {
    /// Creates a bridge bound to the given broker.
    ///
    /// # Errors
    ///
    /// Returns [`A2aError::Configuration`] when the configuration or HTTP
    /// client cannot be materialized.
    pub fn new(
        config: A2aBridgeConfig,
        broker: Arc<dyn EventBroker>,
        source: impl Into<String>,
    ) -> A2aResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| A2aError::Configuration {
                reason: format!("http client: {err}"),
            })?;
        Ok(Self {
            http,
            config,
            broker,
            tracker: CorrelationTracker::new(),
            source: source.into(),
        })
    }

    /// Derives the outbound A2A message for an internal event.
    ///
    /// The first topic segment becomes the target service; the message type
    /// follows from `request`/`response`/`error` segments in the topic.
    #[must_use]
    pub fn to_outbound(&self, event: &Event) -> A2aMessage {
        let message_type = classify_topic(event.topic());
        let mut amcp = json!({
            "topic": event.topic().as_str(),
            "type": event.event_type(),
            "source": event.source(),
        });
        if let (Some(correlation_id), Some(object)) =
            (event.correlation_id(), amcp.as_object_mut())
        {
            object.insert("correlationId".into(), Value::String(correlation_id.into()));
        }
        if let (Some(trace_id), Some(object)) = (event.trace_id(), amcp.as_object_mut()) {
            object.insert("traceId".into(), Value::String(trace_id.into()));
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("amcp".to_owned(), amcp);

        A2aMessage {
            request_id: event.id().to_owned(),
            message_type,
            sender_id: event
                .sender()
                .map_or_else(|| event.source().to_owned(), ToString::to_string),
            target_service: event.topic().first_segment().to_owned(),
            payload: event.data().cloned().unwrap_or(Value::Null),
            timestamp: event.time(),
            metadata,
        }
    }

    /// Pushes an internal event to the external service (one-shot).
    ///
    /// # Errors
    ///
    /// Returns [`A2aError::Transport`] or [`A2aError::Protocol`] on failure.
    pub async fn send(&self, event: &Event) -> A2aResult<()> {
        let message = self.to_outbound(event);
        let url = format!("{}/messages", self.config.endpoint.trim_end_matches('/'));
        self.post(&url, &message, event.correlation_id()).await?;
        Ok(())
    }

    /// Performs a synchronous request/response exchange.
    ///
    /// Publishes the request internally, posts it to the external
    /// `/requests` endpoint, and completes with whichever answer arrives
    /// first: the HTTP body or a correlated inbound response.
    ///
    /// # Errors
    ///
    /// Returns [`A2aError::Correlation`] when the deadline elapses with no
    /// answer, or transport/protocol errors from the HTTP leg.
    pub async fn request(
        &self,
        topic: Topic,
        payload: Value,
        deadline: Duration,
    ) -> A2aResult<Value> {
        let correlation_id = Uuid::new_v4().to_string();
        let pending = self
            .tracker
            .register(correlation_id.clone(), None, BTreeMap::new(), deadline)
            .await?;

        let event = Event::builder(topic)
            .event_type("io.amcp.a2a.request")
            .source(self.source.clone())
            .correlation_id(correlation_id.clone())
            .delivery(DeliveryOptions::Reliable)
            .data(payload)
            .build()?;
        self.broker.publish(event.clone()).await?;

        let message = self.to_outbound(&event);
        let url = format!("{}/requests", self.config.endpoint.trim_end_matches('/'));
        let body = timeout(deadline, self.post(&url, &message, Some(&correlation_id))).await;

        match body {
            Ok(Ok(Some(answer))) if answer.message_type == A2aMessageType::Response => {
                self.tracker.cancel(&correlation_id).await;
                Ok(answer.payload)
            }
            Ok(Ok(Some(answer))) if answer.message_type == A2aMessageType::Error => {
                self.tracker.cancel(&correlation_id).await;
                Err(A2aError::Protocol {
                    reason: answer.payload.to_string(),
                })
            }
            // Accepted without a synchronous answer: wait for the correlated
            // inbound response.
            Ok(Ok(_)) => Ok(pending.outcome().await?),
            Ok(Err(err)) => {
                self.tracker.cancel(&correlation_id).await;
                Err(err)
            }
            Err(_) => {
                self.tracker.cancel(&correlation_id).await;
                Err(A2aError::Correlation(CorrelationError::Timeout {
                    id: correlation_id,
                }))
            }
        }
    }

    /// Ingests an external message: resolves any pending request and
    /// publishes the synthesized internal event.
    ///
    /// # Errors
    ///
    /// Propagates envelope or bus failures.
    pub async fn handle_inbound(&self, message: A2aMessage) -> A2aResult<()> {
        let correlation_id = message
            .correlation_id()
            .map_or_else(|| message.request_id.clone(), str::to_owned);

        if matches!(
            message.message_type,
            A2aMessageType::Response | A2aMessageType::Error
        ) {
            let resolved = self
                .tracker
                .record_response(&correlation_id, message.payload.clone())
                .await;
            if resolved {
                debug!(correlation_id, "inbound message resolved pending request");
            }
        }

        let topic = Topic::parse(format!(
            "a2a.message.{}",
            message.message_type.topic_segment()
        ))
        .map_err(EventError::from)?;
        let event = Event::builder(topic)
            .event_type("io.amcp.a2a.message")
            .source(self.source.clone())
            .correlation_id(correlation_id)
            .delivery(DeliveryOptions::Reliable)
            .data(json!({
                "requestId": message.request_id,
                "senderId": message.sender_id,
                "targetService": message.target_service,
                "payload": message.payload,
            }))
            .build()?;
        self.broker.publish(event).await?;
        Ok(())
    }

    /// Subscribes the bridge to a topic pattern, forwarding every matching
    /// internal event to the external service.
    ///
    /// # Errors
    ///
    /// Propagates broker subscription errors.
    pub async fn attach_outbound(self: Arc<Self>, pattern: TopicPattern) -> A2aResult<()> {
        let broker = Arc::clone(&self.broker);
        let handler: Arc<dyn EventHandler> = Arc::new(ForwardingHandler { bridge: self });
        broker.subscribe("a2a-bridge", pattern, handler).await?;
        Ok(())
    }

    async fn post(
        &self,
        url: &str,
        message: &A2aMessage,
        correlation_id: Option<&str>,
    ) -> A2aResult<Option<A2aMessage>> {
        let mut request = self
            .http
            .post(url)
            .header(VERSION_HEADER, A2A_VERSION)
            .json(message);
        if let Some(correlation_id) = correlation_id {
            request = request.header(CORRELATION_HEADER, correlation_id);
        }
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|err| A2aError::Transport {
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(A2aError::Protocol {
                reason: format!("endpoint returned {status}"),
            });
        }

        let body = response.bytes().await.map_err(|err| A2aError::Protocol {
            reason: format!("body read failed: {err}"),
        })?;
        if body.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|err| A2aError::Protocol {
                reason: format!("unparseable body: {err}"),
            })
    }
}

struct ForwardingHandler {
    bridge: Arc<A2aBridge>,
}

#[async_trait]
impl EventHandler for ForwardingHandler {
    async fn handle_event(&self, event: Event) -> HandlerResult {
        self.bridge.send(&event).await.map_err(|err| {
            warn!(error = %err, "outbound forwarding failed");
            HandlerError::failed(err.to_string())
        })
    }
}

fn classify_topic(topic: &Topic) -> A2aMessageType {
    for segment in topic.segments() {
        match segment {
            "request" => return A2aMessageType::Request,
            "response" => return A2aMessageType::Response,
            "error" => return A2aMessageType::Error,
            _ => {}
        }
    }
    A2aMessageType::Event
}
