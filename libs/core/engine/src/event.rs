//! The observer-facing event envelope broadcast by C3 and framed over the
//! WebSocket endpoint named in the external interface.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// One event delivered to every connected observer. Fields beyond
/// `event_type`/`timestamp` are optional because not every event type
/// populates every field.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    MessageProduced,
    MessageDeleted,
    MessageProcessed,
    MessageReclaimed,
    MessageToDlq,
    Info,
    Error,
}

impl EngineEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            stream_name: None,
            message_id: None,
            payload: None,
            delivery_count: None,
            consumer: None,
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_stream(mut self, stream_name: impl Into<String>) -> Self {
        self.stream_name = Some(stream_name.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_delivery_count(mut self, count: i64) -> Self {
        self.delivery_count = Some(count);
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn message_produced(stream_name: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self::new(EventType::MessageProduced)
            .with_stream(stream_name)
            .with_message_id(message_id)
    }

    pub fn message_deleted(stream_name: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self::new(EventType::MessageDeleted)
            .with_stream(stream_name)
            .with_message_id(message_id)
    }

    pub fn info(details: impl Into<String>) -> Self {
        Self::new(EventType::Info).with_details(details)
    }

    pub fn error(details: impl Into<String>) -> Self {
        Self::new(EventType::Error).with_details(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let event = EngineEvent::message_produced("test-stream", "1-0").with_delivery_count(1);
        assert_eq!(event.event_type, EventType::MessageProduced);
        assert_eq!(event.stream_name.as_deref(), Some("test-stream"));
        assert_eq!(event.message_id.as_deref(), Some("1-0"));
        assert_eq!(event.delivery_count, Some(1));
    }

    #[test]
    fn serializes_without_unset_optionals() {
        let event = EngineEvent::info("expiry observed");
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("streamName").is_none() || json.get("stream_name").is_none());
        assert_eq!(json["details"], "expiry observed");
    }
}
