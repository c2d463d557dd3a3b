//! # Event Registry
//!
//! Holds the payload shape registered for every event type and validates events
//! against it before the bus admits them. A validation failure is terminal: it
//! points at a producer bug, so the event is never queued for retry.

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

use super::{
    event_bus::Event,
    payload::{
        ChatMessagePayload, ChatResponsePayload, DataSyncPayload, EventFailedPayload,
        EventPayload, IntentAnalyzedPayload, ResponseGeneratedPayload, SessionCreatedPayload,
        SessionEndedPayload,
    },
};

/// Routing key of an event. Builtin types serialise to their dotted wire names
/// (`chat.message`, `session.ended`, ...); anything else is `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventType {
    ChatMessage,
    ChatResponse,
    IntentAnalyzed,
    ResponseGenerated,
    SessionCreated,
    SessionEnded,
    EventFailed,
    DataSync,
    Custom(String), // 拡張性のために残す
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::ChatMessage => "chat.message",
            EventType::ChatResponse => "chat.response",
            EventType::IntentAnalyzed => "intent.analyzed",
            EventType::ResponseGenerated => "response.generated",
            EventType::SessionCreated => "session.created",
            EventType::SessionEnded => "session.ended",
            EventType::EventFailed => "event.failed",
            EventType::DataSync => "data.sync",
            EventType::Custom(name) => name,
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, EventType::Custom(_))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        match name {
            "chat.message" => EventType::ChatMessage,
            "chat.response" => EventType::ChatResponse,
            "intent.analyzed" => EventType::IntentAnalyzed,
            "response.generated" => EventType::ResponseGenerated,
            "session.created" => EventType::SessionCreated,
            "session.ended" => EventType::SessionEnded,
            "event.failed" => EventType::EventFailed,
            "data.sync" => EventType::DataSync,
            other => EventType::Custom(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        EventType::from(name.as_str())
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.as_str().to_string()
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EventType::from(s))
    }
}

/// イベントパラメータの型情報
#[derive(Clone, Debug, PartialEq, strum::Display)]
pub enum ParameterType {
    String,
    Int,
    Float,
    Boolean,
    DateTime,
    Json,
    List(Box<ParameterType>),
    Map(Box<ParameterType>),
}

impl ParameterType {
    pub fn matches(&self, value: &JsonValue) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Int => value.is_i64() || value.is_u64(),
            ParameterType::Float => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::DateTime => value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
            ParameterType::Json => true,
            ParameterType::List(inner) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| inner.matches(item))),
            ParameterType::Map(inner) => value
                .as_object()
                .is_some_and(|map| map.values().all(|item| inner.matches(item))),
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "Null",
        JsonValue::Bool(_) => "Boolean",
        JsonValue::Number(n) if n.is_f64() => "Float",
        JsonValue::Number(_) => "Int",
        JsonValue::String(_) => "String",
        JsonValue::Array(_) => "List",
        JsonValue::Object(_) => "Map",
    }
}

/// イベントのメタデータ
#[derive(Clone, Debug)]
pub struct EventInfo {
    pub event_type: EventType,
    /// Fields that must be present in the payload
    pub parameters: HashMap<String, ParameterType>,
    /// Fields that are type-checked only when present
    pub optional_parameters: HashMap<String, ParameterType>,
}

impl EventInfo {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            parameters: HashMap::new(),
            optional_parameters: HashMap::new(),
        }
    }

    pub fn required(mut self, name: &str, parameter_type: ParameterType) -> Self {
        self.parameters.insert(name.to_string(), parameter_type);
        self
    }

    pub fn optional(mut self, name: &str, parameter_type: ParameterType) -> Self {
        self.optional_parameters
            .insert(name.to_string(), parameter_type);
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid type for {field}: expected {expected}, got {got}")]
    InvalidType {
        field: String,
        expected: String,
        got: String,
    },

    #[error("Unknown event type: {event_type}")]
    UnknownEventType { event_type: String },

    #[error("Event type already registered: {event_type}")]
    AlreadyRegistered { event_type: String },
}

pub type SchemaResult<T> = Result<T, SchemaError>;

/// イベントレジストリ
#[derive(Default, Clone)]
pub struct EventRegistry {
    events: Arc<DashMap<EventType, EventInfo>>,
}

impl EventRegistry {
    /// Creates a registry with every builtin event type registered.
    pub fn new() -> Self {
        let registry = Self::default();
        registry.register_builtin_events();
        registry
    }

    fn register_builtin_events(&self) {
        for info in [
            ChatMessagePayload::event_info(),
            ChatResponsePayload::event_info(),
            IntentAnalyzedPayload::event_info(),
            ResponseGeneratedPayload::event_info(),
            SessionCreatedPayload::event_info(),
            SessionEndedPayload::event_info(),
            EventFailedPayload::event_info(),
            DataSyncPayload::event_info(),
        ] {
            self.events.insert(info.event_type.clone(), info);
        }
    }

    pub fn register_event(&self, event_info: EventInfo) -> SchemaResult<()> {
        let key = event_info.event_type.clone();
        if key.as_str().is_empty() {
            return Err(SchemaError::MissingField {
                field: "event_type".to_string(),
            });
        }
        match self.events.entry(key) {
            Entry::Occupied(entry) => Err(SchemaError::AlreadyRegistered {
                event_type: entry.key().to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(event_info);
                Ok(())
            }
        }
    }

    /// カスタムイベントを登録
    pub fn register_custom_event(
        &self,
        name: &str,
        parameters: HashMap<String, ParameterType>,
    ) -> SchemaResult<()> {
        self.register_event(EventInfo {
            event_type: EventType::Custom(name.to_string()),
            parameters,
            optional_parameters: HashMap::new(),
        })
    }

    pub fn get_event_info(&self, event_type: &EventType) -> Option<EventInfo> {
        self.events.get(event_type).map(|info| info.clone())
    }

    pub fn contains_event(&self, event_type: &EventType) -> bool {
        self.events.contains_key(event_type)
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.events.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get_custom_events(&self) -> Vec<EventType> {
        self.events
            .iter()
            .filter(|entry| !entry.key().is_builtin())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Validates the envelope and the payload shape registered for its type.
    pub fn validate(&self, event: &Event) -> SchemaResult<()> {
        if event.event_type.as_str().is_empty() {
            return Err(SchemaError::MissingField {
                field: "event_type".to_string(),
            });
        }
        if event.session_id.is_empty() {
            return Err(SchemaError::MissingField {
                field: "session_id".to_string(),
            });
        }

        let info = self
            .get_event_info(&event.event_type)
            .ok_or_else(|| SchemaError::UnknownEventType {
                event_type: event.event_type.to_string(),
            })?;

        let payload = match &event.payload {
            JsonValue::Object(map) => map,
            JsonValue::Null if info.parameters.is_empty() => return Ok(()),
            other => {
                return Err(SchemaError::InvalidType {
                    field: "payload".to_string(),
                    expected: "Map".to_string(),
                    got: json_kind(other).to_string(),
                })
            }
        };

        for (name, expected) in info.parameters.iter() {
            let value = payload.get(name).ok_or_else(|| SchemaError::MissingField {
                field: format!("payload.{}", name),
            })?;
            check_type(name, expected, value)?;
        }
        for (name, expected) in info.optional_parameters.iter() {
            match payload.get(name) {
                None | Some(JsonValue::Null) => {}
                Some(value) => check_type(name, expected, value)?,
            }
        }
        Ok(())
    }

    /// Builds an [`Event`] from a raw wire envelope, checking the required
    /// envelope fields before the payload shape.
    pub fn parse_envelope(&self, raw: &JsonValue) -> SchemaResult<Event> {
        let envelope = raw.as_object().ok_or_else(|| SchemaError::InvalidType {
            field: "envelope".to_string(),
            expected: "Map".to_string(),
            got: json_kind(raw).to_string(),
        })?;

        let event_type = required_str(envelope, "event_type")?;
        let session_id = required_str(envelope, "session_id")?;
        let timestamp_raw = required_str(envelope, "timestamp")?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp_raw)
            .map_err(|_| SchemaError::InvalidType {
                field: "timestamp".to_string(),
                expected: ParameterType::DateTime.to_string(),
                got: "String".to_string(),
            })?
            .with_timezone(&Utc);

        let correlation_id = match envelope.get("correlation_id") {
            None | Some(JsonValue::Null) => Uuid::new_v4().to_string(),
            Some(JsonValue::String(id)) => id.clone(),
            Some(other) => return Err(invalid("correlation_id", &ParameterType::String, other)),
        };
        let attempt = match envelope.get("attempt") {
            None | Some(JsonValue::Null) => 0,
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| invalid("attempt", &ParameterType::Int, value))?,
        };
        let payload = envelope
            .get("payload")
            .cloned()
            .unwrap_or_else(|| JsonValue::Object(Default::default()));

        let event = Event {
            event_type: EventType::from(event_type),
            session_id: session_id.to_string(),
            correlation_id,
            timestamp,
            attempt,
            payload,
        };
        self.validate(&event)?;
        Ok(event)
    }
}

fn required_str<'a>(
    envelope: &'a serde_json::Map<String, JsonValue>,
    field: &str,
) -> SchemaResult<&'a str> {
    match envelope.get(field) {
        None | Some(JsonValue::Null) => Err(SchemaError::MissingField {
            field: field.to_string(),
        }),
        Some(JsonValue::String(s)) if s.is_empty() => Err(SchemaError::MissingField {
            field: field.to_string(),
        }),
        Some(JsonValue::String(s)) => Ok(s),
        Some(other) => Err(invalid(field, &ParameterType::String, other)),
    }
}

fn check_type(name: &str, expected: &ParameterType, value: &JsonValue) -> SchemaResult<()> {
    if expected.matches(value) {
        Ok(())
    } else {
        Err(invalid(&format!("payload.{}", name), expected, value))
    }
}

fn invalid(field: &str, expected: &ParameterType, got: &JsonValue) -> SchemaError {
    SchemaError::InvalidType {
        field: field.to_string(),
        expected: expected.to_string(),
        got: json_kind(got).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat_event(payload: JsonValue) -> Event {
        Event::new(EventType::ChatMessage, "s1", payload)
    }

    #[test]
    fn test_builtin_events() {
        let registry = EventRegistry::new();
        assert!(registry.contains_event(&EventType::ChatMessage));
        assert!(registry.contains_event(&EventType::SessionEnded));
        assert!(registry.contains_event(&EventType::EventFailed));
        assert!(registry.get_custom_events().is_empty());
    }

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(EventType::from("chat.message"), EventType::ChatMessage);
        assert_eq!(EventType::IntentAnalyzed.to_string(), "intent.analyzed");
        assert_eq!(
            EventType::from("alert.raised"),
            EventType::Custom("alert.raised".to_string())
        );
        let json = serde_json::to_value(EventType::SessionCreated).unwrap();
        assert_eq!(json, json!("session.created"));
    }

    #[test]
    fn test_valid_chat_message() {
        let registry = EventRegistry::new();
        let event = chat_event(json!({
            "platform": "discord",
            "user_id": "u1",
            "message_text": "low risk ETF?",
        }));
        assert!(registry.validate(&event).is_ok());
    }

    #[test]
    fn test_missing_payload_field() {
        let registry = EventRegistry::new();
        let event = chat_event(json!({ "platform": "discord", "user_id": "u1" }));
        assert_eq!(
            registry.validate(&event),
            Err(SchemaError::MissingField {
                field: "payload.message_text".to_string()
            })
        );
    }

    #[test]
    fn test_invalid_payload_type() {
        let registry = EventRegistry::new();
        let event = chat_event(json!({
            "platform": "discord",
            "user_id": 42,
            "message_text": "hi",
        }));
        assert!(matches!(
            registry.validate(&event),
            Err(SchemaError::InvalidType { field, .. }) if field == "payload.user_id"
        ));
    }

    #[test]
    fn test_optional_field_type_checked_when_present() {
        let registry = EventRegistry::new();
        let event = chat_event(json!({
            "platform": "discord",
            "user_id": "u1",
            "message_text": "hi",
            "metadata": "not-a-map",
        }));
        assert!(registry.validate(&event).is_err());
    }

    #[test]
    fn test_missing_session_id() {
        let registry = EventRegistry::new();
        let mut event = chat_event(json!({}));
        event.session_id.clear();
        assert_eq!(
            registry.validate(&event),
            Err(SchemaError::MissingField {
                field: "session_id".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_event_type() {
        let registry = EventRegistry::new();
        let event = Event::new(EventType::Custom("nope".to_string()), "s1", json!({}));
        assert!(matches!(
            registry.validate(&event),
            Err(SchemaError::UnknownEventType { .. })
        ));
    }

    #[test]
    fn test_custom_event_registration() {
        let registry = EventRegistry::new();
        let mut parameters = HashMap::new();
        parameters.insert("severity".to_string(), ParameterType::Int);
        registry
            .register_custom_event("alert.raised", parameters.clone())
            .unwrap();

        assert!(matches!(
            registry.register_custom_event("alert.raised", parameters),
            Err(SchemaError::AlreadyRegistered { .. })
        ));

        let ok = Event::new(EventType::from("alert.raised"), "s1", json!({"severity": 3}));
        assert!(registry.validate(&ok).is_ok());
        let bad = Event::new(EventType::from("alert.raised"), "s1", json!({"severity": 0.5}));
        assert!(registry.validate(&bad).is_err());
    }

    #[test]
    fn test_nested_parameter_types() {
        let list = ParameterType::List(Box::new(ParameterType::String));
        assert!(list.matches(&json!(["a", "b"])));
        assert!(!list.matches(&json!(["a", 1])));
        let map = ParameterType::Map(Box::new(ParameterType::Float));
        assert!(map.matches(&json!({"x": 1.5, "y": 2})));
        assert!(ParameterType::DateTime.matches(&json!("2024-01-01T00:00:00Z")));
        assert!(!ParameterType::DateTime.matches(&json!("yesterday")));
    }

    #[test]
    fn test_parse_envelope() {
        let registry = EventRegistry::new();
        let event = registry
            .parse_envelope(&json!({
                "event_type": "chat.message",
                "session_id": "s1",
                "correlation_id": "c-1",
                "timestamp": "2024-05-01T10:00:00Z",
                "payload": { "platform": "telegram", "user_id": "u9", "message_text": "hello" }
            }))
            .unwrap();
        assert_eq!(event.event_type, EventType::ChatMessage);
        assert_eq!(event.correlation_id, "c-1");
        assert_eq!(event.attempt, 0);
    }

    #[test]
    fn test_parse_envelope_missing_timestamp() {
        let registry = EventRegistry::new();
        let result = registry.parse_envelope(&json!({
            "event_type": "chat.message",
            "session_id": "s1",
            "payload": {}
        }));
        assert_eq!(
            result,
            Err(SchemaError::MissingField {
                field: "timestamp".to_string()
            })
        );
    }

    #[test]
    fn test_parse_envelope_bad_attempt() {
        let registry = EventRegistry::new();
        let result = registry.parse_envelope(&json!({
            "event_type": "session.created",
            "session_id": "s1",
            "timestamp": "2024-05-01T10:00:00Z",
            "attempt": -1,
            "payload": { "user_id": "u", "platform": "discord" }
        }));
        assert!(matches!(result, Err(SchemaError::InvalidType { field, .. }) if field == "attempt"));
    }
}
