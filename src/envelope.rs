//! Envelope - the single record exchanged over a topic.
//!
//! On the wire an envelope is a flat map:
//!
//! ```text
//! { id, timestamp, topicId, sender,
//!   type: "REQUEST" | "RESPONSE" | "NOTIFICATION" | "ERROR",
//!   responseRequired?, correlationId?, payload }
//! ```
//!
//! The `type` tag selects the [`Body`] variant, which carries the
//! variant-specific fields and the typed payload. `result`, `data`, `details`
//! and `parameters` are free-form JSON values and pass through untouched.
//!
//! # Example
//!
//! ```
//! use hcs10_client::{Envelope, WireFormat};
//!
//! let request = Envelope::request("0.0.1001", "0.0.42", "echo", None, true);
//! let bytes = request.encode(WireFormat::Json).unwrap();
//! let decoded = Envelope::decode(&bytes, WireFormat::Json).unwrap();
//! assert_eq!(decoded, request);
//! ```

use std::fmt;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::codec::WireFormat;
use crate::error::{Hcs10Error, Result};

/// A message on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    /// Sender-generated unique id. A request's id is its correlation id.
    pub id: String,
    /// Sender-assigned ISO-8601 creation time. Not checked against delivery time.
    pub timestamp: String,
    /// Topic the envelope is published on.
    pub topic_id: String,
    /// Originating participant.
    pub sender: String,
    /// Variant fields, selected by `type`.
    pub body: Body,
}

/// Variant-specific part of an [`Envelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Request {
        response_required: bool,
        payload: RequestPayload,
    },
    Response {
        correlation_id: String,
        payload: ResponsePayload,
    },
    Notification {
        payload: NotificationPayload,
    },
    Error {
        correlation_id: Option<String>,
        payload: ErrorPayload,
    },
}

/// Flat on-the-wire form of an [`Envelope`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    id: String,
    timestamp: String,
    topic_id: String,
    sender: String,
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    payload: Value,
}

fn payload_from<T: DeserializeOwned>(kind: MessageType, payload: Value) -> std::result::Result<T, String> {
    serde_json::from_value(payload).map_err(|e| format!("invalid {kind} payload: {e}"))
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = String;

    fn try_from(wire: WireEnvelope) -> std::result::Result<Self, Self::Error> {
        let body = match wire.kind {
            MessageType::Request => Body::Request {
                response_required: wire.response_required.unwrap_or(true),
                payload: payload_from(wire.kind, wire.payload)?,
            },
            MessageType::Response => Body::Response {
                correlation_id: wire
                    .correlation_id
                    .ok_or_else(|| "missing field `correlationId`".to_string())?,
                payload: payload_from(wire.kind, wire.payload)?,
            },
            MessageType::Notification => Body::Notification {
                payload: payload_from(wire.kind, wire.payload)?,
            },
            MessageType::Error => Body::Error {
                correlation_id: wire.correlation_id,
                payload: payload_from(wire.kind, wire.payload)?,
            },
        };
        Ok(Envelope {
            id: wire.id,
            timestamp: wire.timestamp,
            topic_id: wire.topic_id,
            sender: wire.sender,
            body,
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let kind = envelope.kind();
        // Payload types hold only string-keyed maps, so conversion cannot fail.
        let (response_required, correlation_id, payload) = match envelope.body {
            Body::Request {
                response_required,
                payload,
            } => (Some(response_required), None, serde_json::to_value(payload)),
            Body::Response {
                correlation_id,
                payload,
            } => (None, Some(correlation_id), serde_json::to_value(payload)),
            Body::Notification { payload } => (None, None, serde_json::to_value(payload)),
            Body::Error {
                correlation_id,
                payload,
            } => (None, correlation_id, serde_json::to_value(payload)),
        };
        WireEnvelope {
            id: envelope.id,
            timestamp: envelope.timestamp,
            topic_id: envelope.topic_id,
            sender: envelope.sender,
            kind,
            response_required,
            correlation_id,
            payload: payload.unwrap_or(Value::Null),
        }
    }
}

/// Keeps an explicit `null` as `Some(Value::Null)` so it survives a round trip.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Payload of a `REQUEST`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
}

/// Outcome carried by a `RESPONSE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failure,
}

/// Application-level error attached to a `FAILURE` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Payload of a `RESPONSE`.
///
/// `result` is meaningful on `SUCCESS`, `error` on `FAILURE`. Nothing stops
/// both from being present; they are carried as given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub status: ResponseStatus,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ResponsePayload {
    /// A `SUCCESS` payload.
    pub fn success(result: Option<Value>) -> Self {
        Self {
            status: ResponseStatus::Success,
            result,
            error: None,
        }
    }

    /// A `FAILURE` payload.
    pub fn failure(error: ErrorInfo) -> Self {
        Self {
            status: ResponseStatus::Failure,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Payload of a `NOTIFICATION`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of a protocol-level `ERROR`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub details: Option<Value>,
}

/// The `type` tag of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "REQUEST",
            MessageType::Response => "RESPONSE",
            MessageType::Notification => "NOTIFICATION",
            MessageType::Error => "ERROR",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a fresh envelope id.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Envelope {
    /// Build an envelope with a fresh id and the current timestamp.
    pub fn new(topic_id: impl Into<String>, sender: impl Into<String>, body: Body) -> Self {
        Self {
            id: generate_id(),
            timestamp: now_timestamp(),
            topic_id: topic_id.into(),
            sender: sender.into(),
            body,
        }
    }

    /// Build a `REQUEST`.
    pub fn request(
        topic_id: impl Into<String>,
        sender: impl Into<String>,
        action: impl Into<String>,
        parameters: Option<Map<String, Value>>,
        response_required: bool,
    ) -> Self {
        Self::new(
            topic_id,
            sender,
            Body::Request {
                response_required,
                payload: RequestPayload {
                    action: action.into(),
                    parameters,
                },
            },
        )
    }

    /// Build a `RESPONSE` answering `correlation_id`.
    pub fn response(
        topic_id: impl Into<String>,
        sender: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: ResponsePayload,
    ) -> Self {
        Self::new(
            topic_id,
            sender,
            Body::Response {
                correlation_id: correlation_id.into(),
                payload,
            },
        )
    }

    /// Build a `NOTIFICATION`.
    pub fn notification(
        topic_id: impl Into<String>,
        sender: impl Into<String>,
        event: impl Into<String>,
        data: Value,
    ) -> Self {
        Self::new(
            topic_id,
            sender,
            Body::Notification {
                payload: NotificationPayload {
                    event: event.into(),
                    data,
                },
            },
        )
    }

    /// Build a protocol-level `ERROR`.
    pub fn error(
        topic_id: impl Into<String>,
        sender: impl Into<String>,
        correlation_id: Option<String>,
        payload: ErrorPayload,
    ) -> Self {
        Self::new(
            topic_id,
            sender,
            Body::Error {
                correlation_id,
                payload,
            },
        )
    }

    /// The `type` tag.
    pub fn kind(&self) -> MessageType {
        match &self.body {
            Body::Request { .. } => MessageType::Request,
            Body::Response { .. } => MessageType::Response,
            Body::Notification { .. } => MessageType::Notification,
            Body::Error { .. } => MessageType::Error,
        }
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        matches!(self.body, Body::Request { .. })
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        matches!(self.body, Body::Response { .. })
    }

    /// Correlation id of a `RESPONSE`, or of an `ERROR` that carries one.
    pub fn correlation_id(&self) -> Option<&str> {
        match &self.body {
            Body::Response { correlation_id, .. } => Some(correlation_id),
            Body::Error { correlation_id, .. } => correlation_id.as_deref(),
            _ => None,
        }
    }

    /// Request payload and its `responseRequired` flag.
    pub fn as_request(&self) -> Option<(&RequestPayload, bool)> {
        match &self.body {
            Body::Request {
                response_required,
                payload,
            } => Some((payload, *response_required)),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&ResponsePayload> {
        match &self.body {
            Body::Response { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn as_notification(&self) -> Option<&NotificationPayload> {
        match &self.body {
            Body::Notification { payload } => Some(payload),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorPayload> {
        match &self.body {
            Body::Error { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Serialize for submission.
    pub fn encode(&self, format: WireFormat) -> Result<Bytes> {
        format.encode(self).map(Bytes::from)
    }

    /// Parse delivered bytes.
    ///
    /// Any failure, including an unknown `type` or a missing required field,
    /// is reported as [`Hcs10Error::MalformedEnvelope`].
    pub fn decode(bytes: &[u8], format: WireFormat) -> Result<Envelope> {
        format
            .decode(bytes)
            .map_err(|e| Hcs10Error::MalformedEnvelope(e.to_string()))
    }
}
