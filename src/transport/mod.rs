//! Transport module - the ordered broadcast topic underneath the protocol.
//!
//! The protocol needs only two primitives from the transport:
//!
//! - `submit(topic, bytes) -> transaction id`
//! - `subscribe(topic, start?) -> stream of (bytes, delivered_at)`
//!
//! Delivery on one subscription must follow submission order for that topic.
//! Nothing is assumed across topics.
//!
//! [`MemoryTransport`] is an in-process implementation used for tests and
//! local development.

mod memory;

pub use memory::MemoryTransport;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::handler::BoxFuture;

/// Receipt identifier returned by a successful submission.
pub type TransactionId = String;

/// One message delivered on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Raw message bytes as submitted.
    pub contents: Bytes,
    /// Consensus/delivery time assigned by the transport.
    pub delivered_at: DateTime<Utc>,
    /// Position of the message in its topic, starting at 1.
    pub sequence_number: u64,
}

/// Push-driven delivery stream for one subscription.
///
/// The stream ends when the transport drops the sender (topic gone, transport
/// closed).
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

/// An ordered, append-only broadcast transport.
pub trait Transport: Send + Sync + 'static {
    /// Submit bytes to a topic.
    ///
    /// Fails with [`Hcs10Error::Transport`](crate::Hcs10Error::Transport).
    fn submit<'a>(
        &'a self,
        topic_id: &'a str,
        message: Bytes,
    ) -> BoxFuture<'a, Result<TransactionId>>;

    /// Open a delivery stream for a topic, optionally replaying from `start_time`.
    ///
    /// Fails with [`Hcs10Error::Subscription`](crate::Hcs10Error::Subscription).
    fn subscribe<'a>(
        &'a self,
        topic_id: &'a str,
        start_time: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<DeliveryStream>>;

    /// Release the underlying connection.
    fn close(&self) {}
}
