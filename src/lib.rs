//! # hcs10-client
//!
//! Request/response messaging over ordered broadcast topics.
//!
//! A broadcast topic (for example a Hedera Consensus Service topic) delivers
//! every submitted message to every subscriber, in order, and nothing more.
//! This crate layers the HCS-10 envelope protocol on top of it:
//!
//! - **Envelopes** - `REQUEST`, `RESPONSE`, `NOTIFICATION` and `ERROR`
//!   records, JSON (default) or MessagePack on the wire
//! - **Correlation** - a response carries its request's id as
//!   `correlationId`; the sender awaits it with a deadline
//! - **Handlers** - per-topic callbacks that see every delivered envelope in
//!   delivery order
//!
//! The transport is pluggable through the [`Transport`] trait;
//! [`MemoryTransport`](transport::MemoryTransport) runs everything in process.
//!
//! ## Example
//!
//! ```ignore
//! use hcs10_client::transport::MemoryTransport;
//! use hcs10_client::{Client, RequestOutcome};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = MemoryTransport::new();
//!     let topic = transport.create_topic(None);
//!
//!     let client = Client::builder(transport)
//!         .sender("0.0.42")
//!         .subscribe(&topic)
//!         .start()
//!         .await?;
//!
//!     if let RequestOutcome::Response(response) =
//!         client.send_request(&topic, "getInfo", None, true).await?
//!     {
//!         println!("{:?}", response.as_response());
//!     }
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod pending;
pub mod subscription;
pub mod transport;

mod client;

pub use client::{
    Client, ClientBuilder, ClientConfig, RequestOutcome, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SENDER,
};
pub use codec::WireFormat;
pub use envelope::{
    Body, Envelope, ErrorInfo, ErrorPayload, MessageType, NotificationPayload, RequestPayload,
    ResponsePayload, ResponseStatus,
};
pub use error::{Hcs10Error, Result};
pub use handler::{handler_fn, HandlerRef, MessageHandler};
pub use subscription::SubscriptionId;
pub use transport::{Delivery, TransactionId, Transport};
