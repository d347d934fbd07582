//! The JSON message envelope shared by every exchange between a proxy and the
//! root agent.
//!
//! Three families of message travel over a port, distinguished by the `type`
//! suffix: `*Request`, `*Response` and `*Event`, plus the two `WCP1*`
//! handshake shapes. Requests and responses are correlated by
//! `meta.requestUuid`; events carry a `meta.eventUuid` instead.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{types::AppIdentifier, Error, Result};

/// Generates a fresh v4 UUID string.
pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Envelope metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_attempt_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<AppIdentifier>,
}

impl MessageMeta {
    fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            request_uuid: None,
            response_uuid: None,
            event_uuid: None,
            connection_attempt_uuid: None,
            source: None,
        }
    }
}

/// A single wire message: camelCase `type` discriminator, `meta` and a
/// type-specific `payload`.
///
/// The payload stays a [`Value`] until a handler knows which shape to expect,
/// at which point [`Message::payload_as`] deserializes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    pub meta: MessageMeta,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    /// Builds a request carrying a freshly generated `requestUuid`.
    pub fn request(
        kind: &str,
        source: Option<AppIdentifier>,
        payload: impl Serialize,
    ) -> Result<Self> {
        let mut meta = MessageMeta::now();
        meta.request_uuid = Some(new_uuid());
        meta.source = source;
        Ok(Self {
            kind: kind.to_string(),
            meta,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Builds the response to `request`, echoing its `requestUuid`.
    pub fn response_to(request: &Message, kind: &str, payload: impl Serialize) -> Result<Self> {
        let mut meta = MessageMeta::now();
        meta.request_uuid = request.meta.request_uuid.clone();
        meta.response_uuid = Some(new_uuid());
        meta.source = request.meta.source.clone();
        Ok(Self {
            kind: kind.to_string(),
            meta,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Builds an error response: the payload carries only the FDC3 error
    /// identifier under `error`.
    pub fn error_response_to(request: &Message, kind: &str, error: &Error) -> Result<Self> {
        Self::response_to(
            request,
            kind,
            serde_json::json!({ "error": error.wire_code() }),
        )
    }

    /// Builds a response correlated to a request uuid directly, for replies
    /// that answer a request first seen on another connection (an intent
    /// result travelling handler -> root -> raiser).
    pub(crate) fn response_keyed(
        request_uuid: &str,
        kind: &str,
        payload: impl Serialize,
    ) -> Result<Self> {
        let mut meta = MessageMeta::now();
        meta.request_uuid = Some(request_uuid.to_string());
        meta.response_uuid = Some(new_uuid());
        Ok(Self {
            kind: kind.to_string(),
            meta,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Builds an event carrying a freshly generated `eventUuid`.
    pub fn event(kind: &str, payload: impl Serialize) -> Result<Self> {
        let mut meta = MessageMeta::now();
        meta.event_uuid = Some(new_uuid());
        Ok(Self {
            kind: kind.to_string(),
            meta,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn is_request(&self) -> bool {
        self.kind.ends_with("Request")
    }

    pub fn is_response(&self) -> bool {
        self.kind.ends_with("Response")
    }

    pub fn is_event(&self) -> bool {
        self.kind.ends_with("Event")
    }

    /// The request uuid, empty for events.
    pub fn request_uuid(&self) -> &str {
        self.meta.request_uuid.as_deref().unwrap_or_default()
    }

    /// The event uuid, empty for requests and responses.
    pub fn event_uuid(&self) -> &str {
        self.meta.event_uuid.as_deref().unwrap_or_default()
    }

    /// The error identifier of an error response, if any.
    pub fn error_code(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }

    /// Deserializes the payload into the expected shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::Protocol(format!("bad {} payload: {e}", self.kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_and_response_share_the_request_uuid() {
        let request =
            Message::request("getUserChannelsRequest", None, json!({})).unwrap();
        let request_uuid = request.meta.request_uuid.clone().unwrap();
        let response =
            Message::response_to(&request, "getUserChannelsResponse", json!({})).unwrap();
        assert_eq!(response.meta.request_uuid.as_deref(), Some(&*request_uuid));
        assert!(response.meta.response_uuid.is_some());
        assert!(request.is_request());
        assert!(response.is_response());
    }

    #[test]
    fn events_carry_an_event_uuid_only() {
        let event = Message::event("broadcastEvent", json!({"channelId": "c"})).unwrap();
        assert!(event.meta.event_uuid.is_some());
        assert!(event.meta.request_uuid.is_none());
        assert!(event.is_event());
    }

    #[test]
    fn error_responses_expose_the_code() {
        let request = Message::request("broadcastRequest", None, json!({})).unwrap();
        let response =
            Message::error_response_to(&request, "broadcastResponse", &Error::AccessDenied)
                .unwrap();
        assert_eq!(response.error_code(), Some("AccessDenied"));
    }

    #[test]
    fn wire_shape_uses_camel_case_meta() {
        let request = Message::request("broadcastRequest", None, json!({})).unwrap();
        let value = serde_json::to_value(&request).unwrap();
        assert!(value["meta"]["requestUuid"].is_string());
        assert!(value["meta"]["timestamp"].is_string());
        assert_eq!(value["type"], "broadcastRequest");
    }
}
