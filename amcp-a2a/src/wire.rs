//! A2A wire schema.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// External message classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum A2aMessageType {
    /// Expects a correlated response.
    Request,
    /// Answers a prior request.
    Response,
    /// Reports a failure for a prior request.
    Error,
    /// One-way notification.
    Event,
}

impl A2aMessageType {
    /// Lowercase form used in inbound topic synthesis
    /// (`a2a.message.<type>`).
    #[must_use]
    pub const fn topic_segment(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Error => "error",
            Self::Event => "event",
        }
    }
}

/// One A2A protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct A2aMessage {
    /// Unique message identifier.
    pub request_id: String,
    /// Message classification.
    pub message_type: A2aMessageType,
    /// Identifier of the sending agent or bridge.
    pub sender_id: String,
    /// Logical destination service.
    pub target_service: String,
    /// Opaque message payload.
    pub payload: Value,
    /// Creation time (RFC 3339 on the wire).
    pub timestamp: DateTime<Utc>,
    /// Transport metadata; AMCP attributes travel under the `amcp` key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl A2aMessage {
    /// Returns the AMCP correlation id carried in the metadata, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata
            .get("amcp")
            .and_then(|amcp| amcp.get("correlationId"))
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_camel_case_keys() {
        let message = A2aMessage {
            request_id: "r1".into(),
            message_type: A2aMessageType::Request,
            sender_id: "amcp://edge1/travel".into(),
            target_service: "travel".into(),
            payload: json!({"city": "Paris"}),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["messageType"], "REQUEST");
        assert_eq!(value["targetService"], "travel");
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn correlation_id_reads_nested_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert("amcp".to_owned(), json!({"correlationId": "c-9"}));
        let message = A2aMessage {
            request_id: "r1".into(),
            message_type: A2aMessageType::Response,
            sender_id: "svc".into(),
            target_service: "travel".into(),
            payload: json!(null),
            timestamp: Utc::now(),
            metadata,
        };
        assert_eq!(message.correlation_id(), Some("c-9"));
    }
}
