//! Typed payloads for the builtin event types.
//!
//! On the wire a payload is an opaque JSON object; these structs are the one
//! concrete shape registered per builtin type. [`EventPayload::event_info`] feeds
//! the shape into the [`EventRegistry`](super::event_registry::EventRegistry) so
//! that validation and the typed view never drift apart.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use super::{
    delivery_queue::AttemptRecord,
    event_registry::{EventInfo, EventType, ParameterType},
};

pub trait EventPayload: Serialize + DeserializeOwned {
    fn event_type() -> EventType;

    /// Payload shape used by the validator
    fn event_info() -> EventInfo;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub platform: String,
    pub user_id: String,
    pub message_text: String,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

impl EventPayload for ChatMessagePayload {
    fn event_type() -> EventType {
        EventType::ChatMessage
    }

    fn event_info() -> EventInfo {
        EventInfo::new(Self::event_type())
            .required("platform", ParameterType::String)
            .required("user_id", ParameterType::String)
            .required("message_text", ParameterType::String)
            .optional("metadata", ParameterType::Map(Box::new(ParameterType::Json)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponsePayload {
    pub response_text: String,
    pub confidence: f64,
    #[serde(default)]
    pub recommendations: Vec<JsonValue>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub processing_time: f64,
}

impl EventPayload for ChatResponsePayload {
    fn event_type() -> EventType {
        EventType::ChatResponse
    }

    fn event_info() -> EventInfo {
        EventInfo::new(Self::event_type())
            .required("response_text", ParameterType::String)
            .required("confidence", ParameterType::Float)
            .optional("recommendations", ParameterType::List(Box::new(ParameterType::Json)))
            .optional("sources", ParameterType::List(Box::new(ParameterType::String)))
            .optional("processing_time", ParameterType::Float)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalyzedPayload {
    pub intent: String,
    pub confidence: f64,
    #[serde(default)]
    pub entities: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl EventPayload for IntentAnalyzedPayload {
    fn event_type() -> EventType {
        EventType::IntentAnalyzed
    }

    fn event_info() -> EventInfo {
        EventInfo::new(Self::event_type())
            .required("intent", ParameterType::String)
            .required("confidence", ParameterType::Float)
            .optional("entities", ParameterType::List(Box::new(ParameterType::Json)))
            .optional("reasoning", ParameterType::String)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseGeneratedPayload {
    pub response_text: String,
    #[serde(default)]
    pub recommendations: Vec<JsonValue>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub generation_time: f64,
}

impl EventPayload for ResponseGeneratedPayload {
    fn event_type() -> EventType {
        EventType::ResponseGenerated
    }

    fn event_info() -> EventInfo {
        EventInfo::new(Self::event_type())
            .required("response_text", ParameterType::String)
            .optional("recommendations", ParameterType::List(Box::new(ParameterType::Json)))
            .optional("sources", ParameterType::List(Box::new(ParameterType::String)))
            .optional("generation_time", ParameterType::Float)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCreatedPayload {
    pub user_id: String,
    pub platform: String,
}

impl EventPayload for SessionCreatedPayload {
    fn event_type() -> EventType {
        EventType::SessionCreated
    }

    fn event_info() -> EventInfo {
        EventInfo::new(Self::event_type())
            .required("user_id", ParameterType::String)
            .required("platform", ParameterType::String)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionEndReason {
    Expired,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEndedPayload {
    pub user_id: String,
    pub platform: String,
    /// Session lifetime in seconds
    pub duration: f64,
    pub message_count: u64,
    pub reason: SessionEndReason,
}

impl EventPayload for SessionEndedPayload {
    fn event_type() -> EventType {
        EventType::SessionEnded
    }

    fn event_info() -> EventInfo {
        EventInfo::new(Self::event_type())
            .required("user_id", ParameterType::String)
            .required("platform", ParameterType::String)
            .required("duration", ParameterType::Float)
            .required("message_count", ParameterType::Int)
            .required("reason", ParameterType::String)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureReason {
    /// Retries ran out
    Exhausted,
    /// The handler reported a fault that retrying cannot fix
    Permanent,
    /// The destination's breaker refused the dispatch
    CircuitOpen,
}

/// Terminal delivery outcome of one (event, subscriber) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFailedPayload {
    pub original_event_type: String,
    pub original_correlation_id: String,
    pub destination: String,
    pub reason: FailureReason,
    pub error: String,
    pub attempts: u32,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    #[serde(default)]
    pub original_payload: JsonValue,
}

impl EventPayload for EventFailedPayload {
    fn event_type() -> EventType {
        EventType::EventFailed
    }

    fn event_info() -> EventInfo {
        EventInfo::new(Self::event_type())
            .required("original_event_type", ParameterType::String)
            .required("original_correlation_id", ParameterType::String)
            .required("destination", ParameterType::String)
            .required("reason", ParameterType::String)
            .required("error", ParameterType::String)
            .required("attempts", ParameterType::Int)
            .optional("history", ParameterType::List(Box::new(ParameterType::Json)))
            .optional("original_payload", ParameterType::Json)
    }
}

/// Cross-store synchronisation notice (relational, vector and graph stores).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSyncPayload {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub source: String,
}

impl EventPayload for DataSyncPayload {
    fn event_type() -> EventType {
        EventType::DataSync
    }

    fn event_info() -> EventInfo {
        EventInfo::new(Self::event_type())
            .required("entity_type", ParameterType::String)
            .required("entity_id", ParameterType::String)
            .required("operation", ParameterType::String)
            .optional("data", ParameterType::Json)
            .optional("source", ParameterType::String)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{event_bus::Event, event_registry::EventRegistry};

    #[test]
    fn test_typed_payloads_satisfy_their_shape() {
        let registry = EventRegistry::new();

        let chat = Event::from_payload(
            "s1",
            &ChatMessagePayload {
                platform: "discord".to_string(),
                user_id: "u1".to_string(),
                message_text: "safe bonds please".to_string(),
                metadata: Map::new(),
            },
        )
        .unwrap();
        assert!(registry.validate(&chat).is_ok());

        let ended = Event::from_payload(
            "s1",
            &SessionEndedPayload {
                user_id: "u1".to_string(),
                platform: "discord".to_string(),
                duration: 1800.0,
                message_count: 0,
                reason: SessionEndReason::Expired,
            },
        )
        .unwrap();
        assert!(registry.validate(&ended).is_ok());

        let failed = Event::from_payload(
            "s1",
            &EventFailedPayload {
                original_event_type: "chat.message".to_string(),
                original_correlation_id: "c1".to_string(),
                destination: "intent-analyzer".to_string(),
                reason: FailureReason::Exhausted,
                error: "boom".to_string(),
                attempts: 5,
                history: vec![],
                original_payload: JsonValue::Null,
            },
        )
        .unwrap();
        assert!(registry.validate(&failed).is_ok());
    }

    #[test]
    fn test_integral_duration_still_valid() {
        // serde_json writes 1800.0 as a float, but producers may send 1800
        let registry = EventRegistry::new();
        let event = Event::new(
            EventType::SessionEnded,
            "s1",
            serde_json::json!({
                "user_id": "u1", "platform": "discord",
                "duration": 1800, "message_count": 2, "reason": "ended"
            }),
        );
        assert!(registry.validate(&event).is_ok());
        let payload: SessionEndedPayload = event.payload_as().unwrap();
        assert_eq!(payload.reason, SessionEndReason::Ended);
    }

    #[test]
    fn test_failure_reason_wire_format() {
        assert_eq!(
            serde_json::to_value(FailureReason::CircuitOpen).unwrap(),
            serde_json::json!("circuit_open")
        );
        assert_eq!(FailureReason::Exhausted.to_string(), "exhausted");
    }
}
