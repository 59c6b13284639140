//! Client builder and request/response coordinator.
//!
//! The [`ClientBuilder`] configures a client over any [`Transport`]. The
//! [`Client`] is the protocol surface:
//!
//! 1. `send_request` - publish a request and (optionally) await its response
//! 2. `send_response` / `send_notification` / `send_error` - publish replies
//!    and one-way messages
//! 3. `subscribe_topic` + `add_handler` - receive everything on a topic
//!
//! # Example
//!
//! ```ignore
//! use hcs10_client::{handler_fn, Client, ResponseStatus};
//! use hcs10_client::transport::MemoryTransport;
//!
//! let transport = MemoryTransport::new();
//! let topic = transport.create_topic(Some("demo"));
//!
//! let client = Client::builder(transport)
//!     .sender("0.0.42")
//!     .request_timeout(std::time::Duration::from_secs(5))
//!     .subscribe(&topic)
//!     .start()
//!     .await?;
//!
//! let responder = client.clone();
//! client.add_handler(&topic, handler_fn(move |envelope| {
//!     let responder = responder.clone();
//!     async move {
//!         if let Some((request, true)) = envelope.as_request() {
//!             let echo = serde_json::json!({ "echo": request.parameters });
//!             responder
//!                 .send_response(&envelope.topic_id, &envelope.id, ResponseStatus::Success, Some(echo), None)
//!                 .await?;
//!         }
//!         Ok(())
//!     }
//! }));
//!
//! let outcome = client.send_request(&topic, "echo", None, true).await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::codec::WireFormat;
use crate::envelope::{Envelope, ErrorInfo, ErrorPayload, ResponsePayload, ResponseStatus};
use crate::error::{Hcs10Error, Result};
use crate::handler::{HandlerRef, HandlerRegistry};
use crate::pending::PendingRequests;
use crate::subscription::{SubscriptionId, SubscriptionManager};
use crate::transport::{TransactionId, Transport};

/// Default time to wait for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sender id used when none is configured.
pub const DEFAULT_SENDER: &str = "anonymous";

/// Client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Written into the `sender` field of every outgoing envelope.
    pub sender: String,
    /// Deadline for `send_request` when no explicit timeout is given.
    pub request_timeout: Duration,
    /// Encoding of envelopes on the topic.
    pub wire_format: WireFormat,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sender: DEFAULT_SENDER.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            wire_format: WireFormat::default(),
        }
    }
}

/// Builder for configuring and starting a [`Client`].
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    handlers: Vec<(String, HandlerRef)>,
    subscriptions: Vec<(String, Option<DateTime<Utc>>)>,
}

impl ClientBuilder {
    /// Create a builder over a transport.
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::with_shared_transport(Arc::new(transport))
    }

    /// Create a builder over an already shared transport.
    pub fn with_shared_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: ClientConfig::default(),
            handlers: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Set the participant id written as `sender`.
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.config.sender = sender.into();
        self
    }

    /// Set the default request timeout.
    ///
    /// Default: 30 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the wire format.
    ///
    /// Default: JSON
    pub fn wire_format(mut self, format: WireFormat) -> Self {
        self.config.wire_format = format;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a handler before any subscription starts delivering.
    pub fn handler(mut self, topic_id: &str, handler: HandlerRef) -> Self {
        self.handlers.push((topic_id.to_string(), handler));
        self
    }

    /// Subscribe to a topic (new messages only) when the client starts.
    pub fn subscribe(mut self, topic_id: &str) -> Self {
        self.subscriptions.push((topic_id.to_string(), None));
        self
    }

    /// Subscribe to a topic from `start_time` when the client starts.
    pub fn subscribe_from(mut self, topic_id: &str, start_time: DateTime<Utc>) -> Self {
        self.subscriptions
            .push((topic_id.to_string(), Some(start_time)));
        self
    }

    /// Build the client, register handlers, then open subscriptions.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(self) -> Result<Client> {
        let client = Client::new(self.transport, self.config);

        for (topic_id, handler) in self.handlers {
            client.add_handler(&topic_id, handler);
        }
        for (topic_id, start_time) in self.subscriptions {
            client.subscribe_topic(&topic_id, start_time).await?;
        }

        Ok(client)
    }
}

/// What `send_request` produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// The matching response.
    Response(Envelope),
    /// The request itself; no response was asked for.
    Sent(Envelope),
}

impl RequestOutcome {
    /// The response, if one was awaited.
    pub fn response(&self) -> Option<&Envelope> {
        match self {
            RequestOutcome::Response(envelope) => Some(envelope),
            RequestOutcome::Sent(_) => None,
        }
    }

    /// The carried envelope, whichever it is.
    pub fn into_envelope(self) -> Envelope {
        match self {
            RequestOutcome::Response(envelope) | RequestOutcome::Sent(envelope) => envelope,
        }
    }
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    pending: Arc<PendingRequests>,
    subscriptions: SubscriptionManager,
    closed: AtomicBool,
}

/// Request/response coordinator over one transport.
///
/// Cheaply cloneable; clones share all state. Handlers typically hold a clone
/// to send responses.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder<T: Transport>(transport: T) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    /// Create a client with no subscriptions or handlers.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let pending = Arc::new(PendingRequests::new());
        let subscriptions = SubscriptionManager::new(
            transport.clone(),
            config.wire_format,
            Arc::new(HandlerRegistry::new()),
            pending.clone(),
        );
        tracing::info!(sender = %config.sender, "Initialized client");

        Self {
            inner: Arc::new(ClientInner {
                transport,
                config,
                pending,
                subscriptions,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Hcs10Error::ClientClosed)
        } else {
            Ok(())
        }
    }

    /// Subscribe to a topic; see [`SubscriptionManager::subscribe`].
    pub async fn subscribe_topic(
        &self,
        topic_id: &str,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<SubscriptionId> {
        self.ensure_open()?;
        let id = self
            .inner
            .subscriptions
            .subscribe(topic_id, start_time)
            .await?;

        // `close` may have run while the transport was subscribing.
        if self.is_closed() {
            self.inner.subscriptions.unsubscribe(&id);
            return Err(Hcs10Error::ClientClosed);
        }
        Ok(id)
    }

    /// Stop a subscription.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.inner.subscriptions.unsubscribe(id)
    }

    /// Most recent subscription for a topic.
    pub fn subscription_for(&self, topic_id: &str) -> Option<SubscriptionId> {
        self.inner.subscriptions.subscription_for(topic_id)
    }

    /// Register a handler for a topic.
    pub fn add_handler(&self, topic_id: &str, handler: HandlerRef) {
        self.inner.subscriptions.add_handler(topic_id, handler);
    }

    /// Remove a handler; `false` if it was not registered on the topic.
    pub fn remove_handler(&self, topic_id: &str, handler: &HandlerRef) -> bool {
        self.inner.subscriptions.remove_handler(topic_id, handler)
    }

    /// Send a request using the configured timeout.
    ///
    /// With `response_required` the call resolves to the matching response or
    /// fails with [`Hcs10Error::RequestTimeout`]. Without it, the call returns
    /// the request as soon as it is submitted.
    pub async fn send_request(
        &self,
        topic_id: &str,
        action: &str,
        parameters: Option<Map<String, Value>>,
        response_required: bool,
    ) -> Result<RequestOutcome> {
        self.send_request_with_timeout(
            topic_id,
            action,
            parameters,
            response_required,
            self.inner.config.request_timeout,
        )
        .await
    }

    /// Send a request with an explicit response timeout.
    pub async fn send_request_with_timeout(
        &self,
        topic_id: &str,
        action: &str,
        parameters: Option<Map<String, Value>>,
        response_required: bool,
        timeout: Duration,
    ) -> Result<RequestOutcome> {
        self.ensure_open()?;
        tracing::info!(topic_id = %topic_id, action = %action, "Sending request");

        let request = Envelope::request(
            topic_id,
            &self.inner.config.sender,
            action,
            parameters,
            response_required,
        );
        let timeout = response_required.then_some(timeout);
        self.submit_then_await(request, timeout).await
    }

    /// Single path for both request kinds.
    ///
    /// The pending entry exists before the submission is started, so a
    /// response can never be delivered ahead of its entry.
    async fn submit_then_await(
        &self,
        request: Envelope,
        timeout: Option<Duration>,
    ) -> Result<RequestOutcome> {
        let waiter = match timeout {
            Some(timeout) => Some(self.inner.pending.register(&request.id, timeout)?),
            None => None,
        };
        // An entry registered after `close` drained the table would never resolve.
        if waiter.is_some() && self.is_closed() {
            self.inner.pending.cancel(&request.id);
            return Err(Hcs10Error::ClientClosed);
        }

        if let Err(e) = self.submit(&request).await {
            if waiter.is_some() {
                self.inner.pending.cancel(&request.id);
            }
            return Err(e);
        }
        tracing::info!(request_id = %request.id, "Request sent");

        match waiter {
            Some(waiter) => waiter.await.map(RequestOutcome::Response),
            None => Ok(RequestOutcome::Sent(request)),
        }
    }

    /// Send a response to `request_id` and return the transaction id.
    ///
    /// `result` and `error` are both carried as given, whatever the status.
    pub async fn send_response(
        &self,
        topic_id: &str,
        request_id: &str,
        status: ResponseStatus,
        result: Option<Value>,
        error: Option<ErrorInfo>,
    ) -> Result<TransactionId> {
        self.ensure_open()?;
        tracing::info!(topic_id = %topic_id, request_id = %request_id, ?status, "Sending response");
        if result.is_some() && error.is_some() {
            tracing::warn!(request_id = %request_id, "Response carries both result and error");
        }

        let response = Envelope::response(
            topic_id,
            &self.inner.config.sender,
            request_id,
            ResponsePayload {
                status,
                result,
                error,
            },
        );
        let transaction_id = self.submit(&response).await?;
        tracing::info!(
            message_id = %response.id,
            transaction_id = %transaction_id,
            "Response sent"
        );
        Ok(transaction_id)
    }

    /// Publish a notification.
    pub async fn send_notification(
        &self,
        topic_id: &str,
        event: &str,
        data: Value,
    ) -> Result<TransactionId> {
        self.ensure_open()?;
        tracing::info!(topic_id = %topic_id, event = %event, "Sending notification");

        let notification = Envelope::notification(topic_id, &self.inner.config.sender, event, data);
        self.submit(&notification).await
    }

    /// Publish a protocol-level error, optionally tied to a request.
    pub async fn send_error(
        &self,
        topic_id: &str,
        correlation_id: Option<&str>,
        code: &str,
        message: &str,
        details: Option<Value>,
    ) -> Result<TransactionId> {
        self.ensure_open()?;
        tracing::info!(topic_id = %topic_id, code = %code, "Sending error");

        let error = Envelope::error(
            topic_id,
            &self.inner.config.sender,
            correlation_id.map(str::to_string),
            ErrorPayload {
                code: code.to_string(),
                message: message.to_string(),
                details,
            },
        );
        self.submit(&error).await
    }

    async fn submit(&self, envelope: &Envelope) -> Result<TransactionId> {
        let topic_id = envelope.topic_id.as_str();
        let bytes = envelope.encode(self.inner.config.wire_format)?;

        self.inner
            .transport
            .submit(topic_id, bytes)
            .await
            .map_err(|e| {
                tracing::error!(topic_id = %topic_id, message_id = %envelope.id, "Error submitting message: {}", e);
                match e {
                    e @ Hcs10Error::Transport { .. } => e,
                    other => Hcs10Error::Transport {
                        topic_id: topic_id.to_string(),
                        reason: other.to_string(),
                    },
                }
            })
    }

    /// Shut the client down.
    ///
    /// Stops all subscriptions, drops every registered handler, fails
    /// in-flight requests with [`Hcs10Error::ClientClosed`], then closes the
    /// transport. Later calls
    /// that would send or subscribe fail with `ClientClosed`. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Closing client");

        let stopped = self.inner.subscriptions.shutdown();
        // Handlers may hold clones of this client.
        let released = self.inner.subscriptions.handlers().clear();
        let failed = self.inner.pending.fail_all();
        self.inner.transport.close();

        tracing::info!(
            subscriptions = stopped,
            handlers = released,
            failed_requests = failed,
            "Client closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_builder_defaults() {
        let builder = ClientBuilder::new(MemoryTransport::new());
        assert_eq!(builder.config, ClientConfig::default());
        assert_eq!(builder.config.request_timeout, Duration::from_secs(30));
        assert_eq!(builder.config.wire_format, WireFormat::Json);
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Client::builder(MemoryTransport::new())
            .sender("0.0.42")
            .request_timeout(Duration::from_millis(750))
            .wire_format(WireFormat::MsgPack)
            .subscribe("0.0.1001")
            .subscribe_from("0.0.1002", Utc::now());

        assert_eq!(builder.config.sender, "0.0.42");
        assert_eq!(builder.config.request_timeout, Duration::from_millis(750));
        assert_eq!(builder.config.wire_format, WireFormat::MsgPack);
        assert_eq!(builder.subscriptions.len(), 2);
        assert!(builder.subscriptions[1].1.is_some());
    }

    #[tokio::test]
    async fn test_start_fails_on_unknown_topic() {
        let result = Client::builder(MemoryTransport::new())
            .subscribe("0.0.404")
            .start()
            .await;
        assert!(matches!(result, Err(Hcs10Error::Subscription { .. })));
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_request() {
        let transport = MemoryTransport::new();
        let topic = transport.create_topic(None);
        let client = Client::builder(transport.clone())
            .sender("0.0.42")
            .start()
            .await
            .unwrap();

        let outcome = client
            .send_request(&topic, "ping", None, false)
            .await
            .unwrap();

        let RequestOutcome::Sent(request) = outcome else {
            panic!("expected the request back");
        };
        assert_eq!(request.sender, "0.0.42");
        assert_eq!(request.as_request().unwrap().0.action, "ping");
        assert_eq!(client.pending_requests(), 0);

        let logged = transport.messages(&topic);
        assert_eq!(logged.len(), 1);
        let on_wire = Envelope::decode(&logged[0].contents, WireFormat::Json).unwrap();
        assert_eq!(on_wire, request);
    }

    #[tokio::test]
    async fn test_submit_failure_leaves_no_pending_entry() {
        let transport = MemoryTransport::new();
        let topic = transport.create_topic(None);
        let client = Client::builder(transport.clone()).start().await.unwrap();

        transport.fail_submits(true);
        let err = client
            .send_request(&topic, "echo", None, true)
            .await
            .unwrap_err();

        assert!(matches!(err, Hcs10Error::Transport { .. }));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_send_response_passes_both_fields_through() {
        let transport = MemoryTransport::new();
        let topic = transport.create_topic(None);
        let client = Client::builder(transport.clone()).start().await.unwrap();

        let tx_id = client
            .send_response(
                &topic,
                "req-1",
                ResponseStatus::Failure,
                Some(serde_json::json!({"partial": true})),
                Some(ErrorInfo::new("E", "both")),
            )
            .await
            .unwrap();
        assert!(tx_id.starts_with(&topic));

        let logged = transport.messages(&topic);
        let response = Envelope::decode(&logged[0].contents, WireFormat::Json).unwrap();
        assert_eq!(response.correlation_id(), Some("req-1"));
        let payload = response.as_response().unwrap();
        assert_eq!(payload.status, ResponseStatus::Failure);
        assert!(payload.result.is_some());
        assert!(payload.error.is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_later_calls() {
        let transport = MemoryTransport::new();
        let topic = transport.create_topic(None);
        let client = Client::builder(transport.clone())
            .subscribe(&topic)
            .start()
            .await
            .unwrap();

        client.close();
        client.close();

        assert!(client.is_closed());
        assert!(transport.is_closed());
        assert!(client.subscription_for(&topic).is_none());
        assert!(matches!(
            client.send_request(&topic, "x", None, false).await,
            Err(Hcs10Error::ClientClosed)
        ));
        assert!(matches!(
            client.send_notification(&topic, "e", Value::Null).await,
            Err(Hcs10Error::ClientClosed)
        ));
        assert!(matches!(
            client.subscribe_topic(&topic, None).await,
            Err(Hcs10Error::ClientClosed)
        ));
    }
}
