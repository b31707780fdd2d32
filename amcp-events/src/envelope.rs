//! Event envelope and builder.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use amcp_primitives::{AgentId, Topic};

/// Result alias for envelope operations.
pub type EventResult<T> = Result<T, EventError>;

/// Errors produced while building or reading envelopes.
#[derive(Debug, Error)]
pub enum EventError {
    /// A required envelope attribute was missing or empty.
    #[error("invalid envelope: {reason}")]
    InvalidEnvelope {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// The routing topic failed validation.
    #[error(transparent)]
    InvalidTopic(#[from] amcp_primitives::Error),

    /// The payload could not be decoded into the requested type.
    #[error("payload decode failed: {source}")]
    PayloadDecode {
        /// Underlying JSON error.
        #[from]
        source: serde_json::Error,
    },
}

impl EventError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidEnvelope {
            reason: reason.into(),
        }
    }
}

/// Delivery semantics requested by the publisher.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOptions {
    /// At-most-once; dropped when a subscriber queue is full.
    #[default]
    BestEffort,
    /// At-least-once with bounded retry and dead-lettering.
    Reliable,
    /// Events sharing a correlation id reach each subscriber in publish order.
    OrderedByCorrelation,
}

impl DeliveryOptions {
    /// Wire representation used in the `amcpdelivery` extension attribute.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::BestEffort => "best_effort",
            Self::Reliable => "reliable",
            Self::OrderedByCorrelation => "ordered",
        }
    }

    /// Parses the wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidEnvelope`] for unknown values.
    pub fn from_wire_name(value: &str) -> EventResult<Self> {
        match value {
            "best_effort" => Ok(Self::BestEffort),
            "reliable" => Ok(Self::Reliable),
            "ordered" => Ok(Self::OrderedByCorrelation),
            other => Err(EventError::invalid(format!(
                "unknown delivery option `{other}`"
            ))),
        }
    }
}

impl fmt::Display for DeliveryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Immutable event envelope.
///
/// Construct with [`Event::builder`]; required attributes are validated at
/// build time, and `id`, `time`, and `spec_version` are auto-filled when
/// omitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: String,
    spec_version: String,
    event_type: String,
    source: String,
    topic: Topic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<AgentId>,
    #[serde(default)]
    delivery: DeliveryOptions,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    span_id: Option<String>,
}

impl Event {
    /// Starts building an event routed on the given topic.
    #[must_use]
    pub fn builder(topic: Topic) -> EventBuilder {
        EventBuilder::new(topic)
    }

    /// Globally unique event identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// CloudEvents spec version, always `"1.0"`.
    #[must_use]
    pub fn spec_version(&self) -> &str {
        &self.spec_version
    }

    /// Reverse-DNS event type, e.g. `io.amcp.task.request`.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// URI-like identifier of the producing agent or context.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Routing topic (distinct from the CloudEvents `type`).
    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Optional subject attribute.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Event creation time (UTC).
    #[must_use]
    pub const fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// MIME type of the payload.
    #[must_use]
    pub fn data_content_type(&self) -> Option<&str> {
        self.data_content_type.as_deref()
    }

    /// Optional schema URI for the payload.
    #[must_use]
    pub fn data_schema(&self) -> Option<&str> {
        self.data_schema.as_deref()
    }

    /// Opaque payload, if any.
    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Decodes the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidEnvelope`] when the event carries no
    /// payload, or [`EventError::PayloadDecode`] when deserialization fails.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> EventResult<T> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| EventError::invalid("event carries no data"))?;
        Ok(serde_json::from_value(data)?)
    }

    /// Correlation id threading a request/response chain.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Identifier of the sending agent.
    #[must_use]
    pub fn sender(&self) -> Option<&AgentId> {
        self.sender.as_ref()
    }

    /// Requested delivery semantics.
    #[must_use]
    pub const fn delivery(&self) -> DeliveryOptions {
        self.delivery
    }

    /// Free-form string metadata (trace baggage and similar).
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Trace identifier, when propagated.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Span identifier, when propagated.
    #[must_use]
    pub fn span_id(&self) -> Option<&str> {
        self.span_id.as_deref()
    }

    pub(crate) fn from_parts(parts: EventBuilder) -> EventResult<Self> {
        let event_type = parts
            .event_type
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| EventError::invalid("`type` must be provided and non-empty"))?;
        let source = parts
            .source
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| EventError::invalid("`source` must be provided and non-empty"))?;

        let data_content_type = match parts.data_content_type {
            Some(ct) => Some(ct),
            None if parts.data.is_some() => Some("application/json".to_owned()),
            None => None,
        };

        Ok(Self {
            id: parts.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            spec_version: "1.0".to_owned(),
            event_type,
            source,
            topic: parts.topic,
            subject: parts.subject,
            time: parts.time.unwrap_or_else(Utc::now),
            data_content_type,
            data_schema: parts.data_schema,
            data: parts.data,
            correlation_id: parts.correlation_id,
            sender: parts.sender,
            delivery: parts.delivery,
            metadata: parts.metadata,
            trace_id: parts.trace_id,
            span_id: parts.span_id,
        })
    }
}

/// Builder for [`Event`].
#[derive(Debug)]
pub struct EventBuilder {
    pub(crate) topic: Topic,
    pub(crate) id: Option<String>,
    pub(crate) event_type: Option<String>,
    pub(crate) source: Option<String>,
    pub(crate) subject: Option<String>,
    pub(crate) time: Option<DateTime<Utc>>,
    pub(crate) data_content_type: Option<String>,
    pub(crate) data_schema: Option<String>,
    pub(crate) data: Option<Value>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) sender: Option<AgentId>,
    pub(crate) delivery: DeliveryOptions,
    pub(crate) metadata: BTreeMap<String, String>,
    pub(crate) trace_id: Option<String>,
    pub(crate) span_id: Option<String>,
}

impl EventBuilder {
    fn new(topic: Topic) -> Self {
        Self {
            topic,
            id: None,
            event_type: None,
            source: None,
            subject: None,
            time: None,
            data_content_type: None,
            data_schema: None,
            data: None,
            correlation_id: None,
            sender: None,
            delivery: DeliveryOptions::default(),
            metadata: BTreeMap::new(),
            trace_id: None,
            span_id: None,
        }
    }

    /// Overrides the auto-generated event id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the reverse-DNS event type (required).
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the producing source identifier (required).
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the optional subject.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Overrides the auto-filled creation time.
    #[must_use]
    pub const fn time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Sets the payload MIME type (defaults to `application/json` when a
    /// payload is attached).
    #[must_use]
    pub fn data_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.data_content_type = Some(content_type.into());
        self
    }

    /// Sets the optional payload schema URI.
    #[must_use]
    pub fn data_schema(mut self, schema: impl Into<String>) -> Self {
        self.data_schema = Some(schema.into());
        self
    }

    /// Attaches the payload.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Records the sending agent.
    #[must_use]
    pub fn sender(mut self, sender: AgentId) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Selects delivery semantics (defaults to best-effort).
    #[must_use]
    pub const fn delivery(mut self, delivery: DeliveryOptions) -> Self {
        self.delivery = delivery;
        self
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn metadata_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replaces the metadata map.
    #[must_use]
    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the trace id.
    #[must_use]
    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Sets the span id.
    #[must_use]
    pub fn span_id(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = Some(span_id.into());
        self
    }

    /// Finalizes the envelope, validating required attributes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidEnvelope`] when `type` or `source` are
    /// missing or empty.
    pub fn build(self) -> EventResult<Event> {
        Event::from_parts(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topic(s: &str) -> Topic {
        Topic::parse(s).expect("topic")
    }

    #[test]
    fn builds_with_auto_filled_attributes() {
        let event = Event::builder(topic("weather.alert.storm"))
            .event_type("io.amcp.weather.alert")
            .source("amcp://demo/weather")
            .data(json!({"severity": "high"}))
            .build()
            .unwrap();

        assert_eq!(event.spec_version(), "1.0");
        assert!(!event.id().is_empty());
        assert_eq!(event.data_content_type(), Some("application/json"));
        assert_eq!(event.delivery(), DeliveryOptions::BestEffort);
    }

    #[test]
    fn missing_type_is_rejected() {
        let err = Event::builder(topic("weather.alert"))
            .source("amcp://demo/weather")
            .build()
            .expect_err("type required");
        assert!(matches!(err, EventError::InvalidEnvelope { .. }));
    }

    #[test]
    fn empty_source_is_rejected() {
        let err = Event::builder(topic("weather.alert"))
            .event_type("io.amcp.weather.alert")
            .source("  ")
            .build()
            .expect_err("source required");
        assert!(matches!(err, EventError::InvalidEnvelope { .. }));
    }

    #[test]
    fn decodes_typed_payload() {
        #[derive(serde::Deserialize)]
        struct Alert {
            severity: String,
        }

        let event = Event::builder(topic("weather.alert"))
            .event_type("io.amcp.weather.alert")
            .source("amcp://demo/weather")
            .data(json!({"severity": "high"}))
            .build()
            .unwrap();

        let alert: Alert = event.data_as().unwrap();
        assert_eq!(alert.severity, "high");
    }

    #[test]
    fn delivery_wire_names_round_trip() {
        for delivery in [
            DeliveryOptions::BestEffort,
            DeliveryOptions::Reliable,
            DeliveryOptions::OrderedByCorrelation,
        ] {
            assert_eq!(
                DeliveryOptions::from_wire_name(delivery.wire_name()).unwrap(),
                delivery
            );
        }
        assert!(DeliveryOptions::from_wire_name("exactly_once").is_err());
    }
}
