use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{
    clock::{elapsed, shift, to_delta},
    config::duration_ms,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageType {
    UserQuery,
    SystemResponse,
    SystemError,
}

/// One turn of a conversation. Never mutated once appended to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub message_id: String,
    pub message_type: MessageType,
    pub content: String,
    pub timestamp: DateTime<Utc>,

    // analysis of a user query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    // what a system response was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Vec<JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_time: Option<f64>,
}

impl ConversationMessage {
    pub fn new(message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            message_type,
            content: content.into(),
            timestamp: Utc::now(),
            intent: None,
            entities: None,
            confidence: None,
            recommendations: None,
            sources: None,
            generation_time: None,
        }
    }

    pub fn user_query(content: impl Into<String>) -> Self {
        Self::new(MessageType::UserQuery, content)
    }

    pub fn system_response(content: impl Into<String>) -> Self {
        Self::new(MessageType::SystemResponse, content)
    }

    pub fn system_error(content: impl Into<String>) -> Self {
        Self::new(MessageType::SystemError, content)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_intent(mut self, intent: JsonValue, entities: Vec<JsonValue>, confidence: f64) -> Self {
        self.intent = Some(intent);
        self.entities = Some(entities);
        self.confidence = Some(confidence);
        self
    }

    pub fn with_response(
        mut self,
        recommendations: Vec<JsonValue>,
        sources: Vec<String>,
        generation_time: f64,
    ) -> Self {
        self.recommendations = Some(recommendations);
        self.sources = Some(sources);
        self.generation_time = Some(generation_time);
        self
    }
}

/// Conversational context for one `(user_id, platform)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub platform: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub messages: Vec<ConversationMessage>,
    pub context: HashMap<String, JsonValue>,
    #[serde(with = "duration_ms")]
    pub expiry_ttl: Duration,
}

impl Session {
    pub fn new(user_id: &str, platform: &str, now: DateTime<Utc>, expiry_ttl: Duration) -> Self {
        Self {
            session_id: generate_session_id(user_id, platform),
            user_id: user_id.to_string(),
            platform: platform.to_string(),
            created_at: now,
            last_activity_at: now,
            messages: Vec::new(),
            context: HashMap::new(),
            expiry_ttl,
        }
    }

    /// Strictly greater: a session idle for exactly its TTL is still alive.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.last_activity_at > to_delta(self.expiry_ttl)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        shift(self.last_activity_at, self.expiry_ttl)
    }

    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.created_at, now)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        // never move backwards if callers race on the clock
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    pub fn summary(&self, now: DateTime<Utc>) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            platform: self.platform.clone(),
            duration_seconds: self.duration(now).as_secs_f64(),
            message_count: self.message_count(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

pub fn generate_session_id(user_id: &str, platform: &str) -> String {
    format!("{}_{}_{}", platform, user_id, Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionValidity {
    Valid,
    Expired,
    NotFound,
}

/// Aggregate view over every live session.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub unique_users: usize,
    /// Mean age of the active sessions, in seconds
    pub avg_duration: f64,
    pub avg_messages_per_session: f64,
}

/// Per-session statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub platform: String,
    pub duration_seconds: f64,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}
