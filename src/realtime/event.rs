//! Typed realtime events and the `{"type", "payload"}` wire codec.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Closed set of event tags carried on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "chat.delta")]
    ChatDelta,
    #[serde(rename = "chat.complete")]
    ChatComplete,
    #[serde(rename = "agent.status")]
    AgentStatus,
    #[serde(rename = "task.update")]
    TaskUpdate,
    #[serde(rename = "metrics.update")]
    MetricsUpdate,
    #[serde(rename = "connection.state")]
    ConnectionState,
    #[serde(rename = "error")]
    Error,
}

/// Coarse classification of an [`EventType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Data,
    Status,
    Error,
}

impl EventType {
    /// Every known event type, in declaration order.
    pub const ALL: [EventType; 7] = [
        EventType::ChatDelta,
        EventType::ChatComplete,
        EventType::AgentStatus,
        EventType::TaskUpdate,
        EventType::MetricsUpdate,
        EventType::ConnectionState,
        EventType::Error,
    ];

    /// Wire tag used in the `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ChatDelta => "chat.delta",
            EventType::ChatComplete => "chat.complete",
            EventType::AgentStatus => "agent.status",
            EventType::TaskUpdate => "task.update",
            EventType::MetricsUpdate => "metrics.update",
            EventType::ConnectionState => "connection.state",
            EventType::Error => "error",
        }
    }

    pub fn category(self) -> EventCategory {
        match self {
            EventType::ChatDelta
            | EventType::ChatComplete
            | EventType::TaskUpdate
            | EventType::MetricsUpdate => EventCategory::Data,
            EventType::AgentStatus | EventType::ConnectionState => EventCategory::Status,
            EventType::Error => EventCategory::Error,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a wire tag is not part of [`EventType`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event type `{0}`")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == tag)
            .ok_or_else(|| UnknownEventType(tag.to_string()))
    }
}

/// A dispatched event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Value,
    /// Milliseconds since the Unix epoch at the time the event was created.
    pub timestamp: u64,
}

impl Event {
    /// Creates an event stamped with the current wall-clock time.
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
            timestamp: now_ms(),
        }
    }

    /// Error-category event for a payload that could not be parsed.
    pub fn protocol_error(raw: &str, message: impl fmt::Display) -> Self {
        Self::new(
            EventType::Error,
            json!({
                "kind": "protocol",
                "message": message.to_string(),
                "raw": raw,
            }),
        )
    }

    /// Error-category event for a connection-level failure.
    pub fn transport_error(message: impl fmt::Display) -> Self {
        Self::new(
            EventType::Error,
            json!({
                "kind": "transport",
                "message": message.to_string(),
            }),
        )
    }

    pub fn category(&self) -> EventCategory {
        self.event_type.category()
    }
}

/// Result of decoding one inbound transport message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A routable event.
    Event(Event),
    /// The text was not valid JSON; carries the error event to dispatch.
    Malformed(Event),
    /// Valid JSON without a recognized `type`; nothing to dispatch.
    Unroutable(Option<String>),
}

/// Decodes an inbound `{"type": string, "payload": any}` message.
pub fn decode_inbound(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return Inbound::Malformed(Event::protocol_error(text, err)),
    };

    let Some(tag) = value.get("type").and_then(Value::as_str) else {
        return Inbound::Unroutable(None);
    };
    let Ok(event_type) = tag.parse::<EventType>() else {
        return Inbound::Unroutable(Some(tag.to_string()));
    };

    let payload = value.get("payload").cloned().unwrap_or(Value::Null);
    Inbound::Event(Event::new(event_type, payload))
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    #[serde(rename = "type")]
    event_type: EventType,
    payload: &'a Value,
}

/// Encodes an outbound message in the same shape the channel accepts.
pub fn encode_outbound(event_type: EventType, payload: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutboundMessage {
        event_type,
        payload,
    })
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
