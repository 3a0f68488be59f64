//! Event envelope shared by the time-service producer and consumer
//!
//! Every Kafka message on the time-service topics is a JSON object with
//! exactly three fields:
//!
//! ```json
//! {
//!   "timestamp": "2024-05-01T12:00:00.123456Z",
//!   "event_type": "http_request",
//!   "data": { "user_ip": "1.2.3.4", "method": "GET", "endpoint": "/" }
//! }
//! ```
//!
//! `data` is schema-less on the wire. The shape is tied to `event_type` by
//! convention; the typed structs in [`payloads`] re-derive it on the consumer
//! side.
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod payloads;

pub use payloads::{ErrorData, EventPayload, HttpRequestData, HttpResponseData};

/// Default topic names used when the environment does not override them
pub mod topics {
    /// General lifecycle events (responses, errors, custom events)
    pub const DEFAULT_EVENTS: &str = "simple-time-service-events";
    /// Inbound request events, keyed by client IP
    pub const DEFAULT_REQUESTS: &str = "simple-time-service-requests";
}

/// Open JSON object carried in the `data` field
pub type EventData = Map<String, Value>;

/// Dispatch key of an envelope.
///
/// Known kinds get their own variant; anything else is preserved verbatim as
/// `Custom`. Build values with `EventKind::from` so that a known name never
/// ends up inside `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    HttpRequest,
    HttpResponse,
    Error,
    Custom(String),
}

impl EventKind {
    pub const HTTP_REQUEST: &'static str = "http_request";
    pub const HTTP_RESPONSE: &'static str = "http_response";
    pub const ERROR: &'static str = "error";

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::HttpRequest => Self::HTTP_REQUEST,
            EventKind::HttpResponse => Self::HTTP_RESPONSE,
            EventKind::Error => Self::ERROR,
            EventKind::Custom(name) => name,
        }
    }

    /// True for the kinds with a fixed payload shape
    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Custom(_))
    }

    /// Empty or whitespace-only names cannot be dispatched
    pub fn is_blank(&self) -> bool {
        self.as_str().trim().is_empty()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        match value {
            Self::HTTP_REQUEST => EventKind::HttpRequest,
            Self::HTTP_RESPONSE => EventKind::HttpResponse,
            Self::ERROR => EventKind::Error,
            other => EventKind::Custom(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        EventKind::from(value.as_str())
    }
}

impl From<&String> for EventKind {
    fn from(value: &String) -> Self {
        EventKind::from(value.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EventKind::from(s))
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(EventKind::from(raw))
    }
}

/// Errors raised while encoding or decoding an envelope
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("envelope has a blank event_type")]
    MissingEventType,
}

/// The three-field record exchanged over the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// ISO-8601 UTC publish time with a trailing `Z`
    #[serde(default)]
    pub timestamp: String,
    pub event_type: EventKind,
    #[serde(default)]
    pub data: EventData,
}

impl EventEnvelope {
    /// Stamp a new envelope with the current UTC time
    pub fn new(event_type: impl Into<EventKind>, data: EventData) -> Self {
        Self {
            timestamp: now_timestamp(),
            event_type: event_type.into(),
            data,
        }
    }

    /// Build an envelope from a typed payload
    pub fn from_payload<P: EventPayload>(payload: P) -> Self {
        Self::new(P::kind(), payload.into_data())
    }

    /// Encode for the wire. Refuses envelopes the decoder would reject.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        if self.event_type.is_blank() {
            return Err(EnvelopeError::MissingEventType);
        }
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a wire payload, rejecting envelopes without an event type
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: EventEnvelope = serde_json::from_slice(bytes)?;
        if envelope.event_type.is_blank() {
            return Err(EnvelopeError::MissingEventType);
        }
        Ok(envelope)
    }

    /// Re-derive the typed payload from the open `data` map
    pub fn decode_data<P: EventPayload>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(Value::Object(self.data.clone()))
    }
}

/// Current UTC time in the envelope timestamp format
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
