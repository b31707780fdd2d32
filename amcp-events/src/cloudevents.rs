//! Strict CloudEvents 1.0 JSON projection.
//!
//! The projection emits exactly the CloudEvents attribute names; everything
//! AMCP-specific travels as extension attributes prefixed with `amcp`.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use amcp_primitives::{AgentId, Topic};

use crate::envelope::{DeliveryOptions, Event, EventError, EventResult};

const META_PREFIX: &str = "amcpmeta";

/// Projects the event onto the CloudEvents 1.0 JSON object model.
#[must_use]
pub fn to_cloudevents(event: &Event) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("id".into(), Value::String(event.id().to_owned()));
    map.insert("source".into(), Value::String(event.source().to_owned()));
    map.insert(
        "specversion".into(),
        Value::String(event.spec_version().to_owned()),
    );
    map.insert("type".into(), Value::String(event.event_type().to_owned()));
    map.insert(
        "time".into(),
        Value::String(event.time().to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    if let Some(subject) = event.subject() {
        map.insert("subject".into(), Value::String(subject.to_owned()));
    }
    if let Some(content_type) = event.data_content_type() {
        map.insert(
            "datacontenttype".into(),
            Value::String(content_type.to_owned()),
        );
    }
    if let Some(schema) = event.data_schema() {
        map.insert("dataschema".into(), Value::String(schema.to_owned()));
    }
    if let Some(data) = event.data() {
        map.insert("data".into(), data.clone());
    }

    map.insert(
        "amcptopic".into(),
        Value::String(event.topic().as_str().to_owned()),
    );
    map.insert(
        "amcpdelivery".into(),
        Value::String(event.delivery().wire_name().to_owned()),
    );
    if let Some(correlation_id) = event.correlation_id() {
        map.insert(
            "amcpcorrelationid".into(),
            Value::String(correlation_id.to_owned()),
        );
    }
    if let Some(sender) = event.sender() {
        map.insert("amcpsender".into(), Value::String(sender.to_string()));
    }
    if let Some(trace_id) = event.trace_id() {
        map.insert("amcptraceid".into(), Value::String(trace_id.to_owned()));
    }
    if let Some(span_id) = event.span_id() {
        map.insert("amcpspanid".into(), Value::String(span_id.to_owned()));
    }
    for (key, value) in event.metadata() {
        map.insert(format!("{META_PREFIX}{key}"), Value::String(value.clone()));
    }

    map
}

fn required_str<'a>(map: &'a Map<String, Value>, key: &str) -> EventResult<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EventError::InvalidEnvelope {
            reason: format!("missing required attribute `{key}`"),
        })
}

fn optional_str<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

/// Reconstructs an event from its CloudEvents projection.
///
/// # Errors
///
/// Returns [`EventError::InvalidEnvelope`] when required attributes are
/// missing or malformed, or the topic extension fails validation.
pub fn from_cloudevents(map: &Map<String, Value>) -> EventResult<Event> {
    let spec_version = required_str(map, "specversion")?;
    if spec_version != "1.0" {
        return Err(EventError::InvalidEnvelope {
            reason: format!("unsupported specversion `{spec_version}`"),
        });
    }

    let topic = Topic::parse(required_str(map, "amcptopic")?)?;
    let time = optional_str(map, "time")
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|err| EventError::InvalidEnvelope {
                    reason: format!("invalid `time`: {err}"),
                })
        })
        .transpose()?;
    let sender = optional_str(map, "amcpsender")
        .map(|raw| {
            raw.parse::<AgentId>()
                .map_err(|err| EventError::InvalidEnvelope {
                    reason: format!("invalid `amcpsender`: {err}"),
                })
        })
        .transpose()?;
    let delivery = optional_str(map, "amcpdelivery")
        .map(DeliveryOptions::from_wire_name)
        .transpose()?
        .unwrap_or_default();

    let mut metadata = BTreeMap::new();
    for (key, value) in map {
        if let Some(meta_key) = key.strip_prefix(META_PREFIX) {
            if let Some(value) = value.as_str() {
                metadata.insert(meta_key.to_owned(), value.to_owned());
            }
        }
    }

    let mut builder = Event::builder(topic)
        .id(required_str(map, "id")?)
        .event_type(required_str(map, "type")?)
        .source(required_str(map, "source")?)
        .delivery(delivery)
        .metadata(metadata);

    if let Some(time) = time {
        builder = builder.time(time);
    }
    if let Some(subject) = optional_str(map, "subject") {
        builder = builder.subject(subject);
    }
    if let Some(content_type) = optional_str(map, "datacontenttype") {
        builder = builder.data_content_type(content_type);
    }
    if let Some(schema) = optional_str(map, "dataschema") {
        builder = builder.data_schema(schema);
    }
    if let Some(data) = map.get("data") {
        builder = builder.data(data.clone());
    }
    if let Some(correlation_id) = optional_str(map, "amcpcorrelationid") {
        builder = builder.correlation_id(correlation_id);
    }
    if let Some(sender) = sender {
        builder = builder.sender(sender);
    }
    if let Some(trace_id) = optional_str(map, "amcptraceid") {
        builder = builder.trace_id(trace_id);
    }
    if let Some(span_id) = optional_str(map, "amcpspanid") {
        builder = builder.span_id(span_id);
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> Event {
        Event::builder(Topic::parse("weather.alert.storm").unwrap())
            .event_type("io.amcp.weather.alert")
            .source("amcp://edge1/weather")
            .subject("storm-warning")
            .correlation_id("corr-17")
            .sender(AgentId::new("weather", "demo").unwrap())
            .delivery(DeliveryOptions::Reliable)
            .trace_id("trace-9")
            .span_id("span-3")
            .metadata_entry("tenant", "acme")
            .data(json!({"severity": "high"}))
            .build()
            .unwrap()
    }

    #[test]
    fn projection_uses_cloudevents_attribute_names() {
        let event = sample_event();
        let map = to_cloudevents(&event);

        for key in ["id", "source", "specversion", "type", "time", "data"] {
            assert!(map.contains_key(key), "missing `{key}`");
        }
        assert_eq!(map["specversion"], json!("1.0"));
        assert_eq!(map["amcptopic"], json!("weather.alert.storm"));
        assert_eq!(map["amcpdelivery"], json!("reliable"));
        assert_eq!(map["amcpcorrelationid"], json!("corr-17"));
        assert_eq!(map["amcptraceid"], json!("trace-9"));
        assert_eq!(map["amcpmetatenant"], json!("acme"));
        // No bare (un-prefixed) AMCP attributes may leak into the projection.
        assert!(!map.contains_key("topic"));
        assert!(!map.contains_key("delivery"));
        assert!(!map.contains_key("metadata"));
    }

    #[test]
    fn round_trips_through_projection() {
        let event = sample_event();
        let restored = from_cloudevents(&to_cloudevents(&event)).unwrap();

        assert_eq!(restored.id(), event.id());
        assert_eq!(restored.topic(), event.topic());
        assert_eq!(restored.event_type(), event.event_type());
        assert_eq!(restored.correlation_id(), event.correlation_id());
        assert_eq!(restored.sender(), event.sender());
        assert_eq!(restored.delivery(), event.delivery());
        assert_eq!(restored.metadata(), event.metadata());
        assert_eq!(restored.data(), event.data());
    }

    #[test]
    fn rejects_missing_required_attributes() {
        let mut map = to_cloudevents(&sample_event());
        map.remove("source");
        let err = from_cloudevents(&map).expect_err("source required");
        assert!(matches!(err, EventError::InvalidEnvelope { .. }));
    }

    #[test]
    fn rejects_unknown_spec_version() {
        let mut map = to_cloudevents(&sample_event());
        map.insert("specversion".into(), json!("2.0"));
        assert!(from_cloudevents(&map).is_err());
    }
}
