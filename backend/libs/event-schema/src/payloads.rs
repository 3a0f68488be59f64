use crate::{EventData, EventKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A payload with a fixed shape bound to one event kind.
///
/// `into_data` writes the named fields last, so they win over colliding keys
/// in `extra`.
pub trait EventPayload: Serialize + DeserializeOwned {
    const KIND: &'static str;

    fn kind() -> EventKind {
        EventKind::from(Self::KIND)
    }

    fn into_data(self) -> EventData;
}

/// `http_request`: an inbound request observed by the HTTP layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestData {
    pub user_ip: String,
    pub method: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(flatten)]
    pub extra: EventData,
}

impl EventPayload for HttpRequestData {
    const KIND: &'static str = EventKind::HTTP_REQUEST;

    fn into_data(self) -> EventData {
        let mut data = self.extra;
        data.insert("user_ip".to_string(), Value::String(self.user_ip));
        data.insert("method".to_string(), Value::String(self.method));
        data.insert("endpoint".to_string(), Value::String(self.endpoint));
        if let Some(hostname) = self.hostname {
            data.insert("hostname".to_string(), Value::String(hostname));
        }
        if let Some(os) = self.os {
            data.insert("os".to_string(), Value::String(os));
        }
        data
    }
}

/// `http_response`: the outcome of a served request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponseData {
    pub user_ip: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    #[serde(flatten)]
    pub extra: EventData,
}

impl EventPayload for HttpResponseData {
    const KIND: &'static str = EventKind::HTTP_RESPONSE;

    fn into_data(self) -> EventData {
        let mut data = self.extra;
        data.insert("user_ip".to_string(), Value::String(self.user_ip));
        data.insert("status_code".to_string(), json!(self.status_code));
        data.insert("response_time_ms".to_string(), json!(self.response_time_ms));
        data
    }
}

/// `error`: a failure while serving a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub error_message: String,
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(flatten)]
    pub extra: EventData,
}

impl EventPayload for ErrorData {
    const KIND: &'static str = EventKind::ERROR;

    fn into_data(self) -> EventData {
        let mut data = self.extra;
        data.insert("error_message".to_string(), Value::String(self.error_message));
        data.insert("error_type".to_string(), Value::String(self.error_type));
        if let Some(endpoint) = self.endpoint {
            data.insert("endpoint".to_string(), Value::String(endpoint));
        }
        data
    }
}
