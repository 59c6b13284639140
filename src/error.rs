//! Error types for hcs10-client.

use thiserror::Error;

/// Main error type for all hcs10 operations.
///
/// Only plumbing failures live here. A `FAILURE` response or an `ERROR`
/// envelope is ordinary data and is delivered as an [`Envelope`](crate::Envelope).
#[derive(Debug, Error)]
pub enum Hcs10Error {
    /// Delivered bytes were not a valid envelope.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The transport rejected a subscribe call.
    #[error("Subscription to topic {topic_id} failed: {reason}")]
    Subscription { topic_id: String, reason: String },

    /// The transport rejected a submission.
    #[error("Submission to topic {topic_id} failed: {reason}")]
    Transport { topic_id: String, reason: String },

    /// No matching response arrived before the deadline.
    #[error("Request {id} timed out after {timeout_ms}ms")]
    RequestTimeout { id: String, timeout_ms: u64 },

    /// A registered handler failed.
    #[error("Handler error: {0}")]
    Handler(String),

    /// The client was closed while the operation was in flight, or before it started.
    #[error("Client closed")]
    ClientClosed,

    /// A request with this correlation id is already pending.
    #[error("Duplicate correlation id: {0}")]
    DuplicateRequest(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl Hcs10Error {
    /// Build a handler error from anything displayable.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Hcs10Error::Handler(message.to_string())
    }
}

/// Result type alias using Hcs10Error.
pub type Result<T> = std::result::Result<T, Hcs10Error>;
