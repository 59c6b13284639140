//! Subscription manager - bridges delivery streams into envelope dispatch.
//!
//! Every subscription runs two tasks:
//!
//! ```text
//! transport stream ─► reader ─┬─► pending.complete(correlationId)   (responses)
//!                             └─► mpsc queue ─► handler worker ─► handlers
//! ```
//!
//! The reader decodes and correlates; it never waits on a handler, so a slow
//! or blocked handler cannot hold up matching of other in-flight requests. The
//! worker runs the topic's handlers one envelope at a time, in delivery order,
//! so handlers still observe the transport's ordering.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::codec::WireFormat;
use crate::envelope::{Body, Envelope};
use crate::error::{Hcs10Error, Result};
use crate::handler::{HandlerRef, HandlerRegistry};
use crate::pending::PendingRequests;
use crate::transport::{DeliveryStream, Transport};

/// Opaque identifier of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct ActiveSubscription {
    topic_id: String,
    reader: JoinHandle<()>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct Subscriptions {
    active: HashMap<SubscriptionId, ActiveSubscription>,
    latest_by_topic: HashMap<String, SubscriptionId>,
}

/// Owns live subscriptions and the per-topic handler registry.
pub struct SubscriptionManager {
    transport: Arc<dyn Transport>,
    format: WireFormat,
    handlers: Arc<HandlerRegistry>,
    pending: Arc<PendingRequests>,
    subscriptions: Mutex<Subscriptions>,
}

impl SubscriptionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        format: WireFormat,
        handlers: Arc<HandlerRegistry>,
        pending: Arc<PendingRequests>,
    ) -> Self {
        Self {
            transport,
            format,
            handlers,
            pending,
            subscriptions: Mutex::new(Subscriptions::default()),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Open one delivery stream for `topic_id` and start dispatching from it.
    ///
    /// A transport rejection is returned as [`Hcs10Error::Subscription`] and
    /// is not retried.
    pub async fn subscribe(
        &self,
        topic_id: &str,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<SubscriptionId> {
        tracing::info!(topic_id = %topic_id, ?start_time, "Subscribing to topic");

        let stream = self
            .transport
            .subscribe(topic_id, start_time)
            .await
            .map_err(|e| {
                tracing::error!(topic_id = %topic_id, "Error subscribing to topic: {}", e);
                match e {
                    e @ Hcs10Error::Subscription { .. } => e,
                    other => Hcs10Error::Subscription {
                        topic_id: topic_id.to_string(),
                        reason: other.to_string(),
                    },
                }
            })?;

        let id = SubscriptionId::generate();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_handlers(self.handlers.clone(), queue_rx));
        let reader = tokio::spawn(read_deliveries(
            id.clone(),
            stream,
            self.format,
            self.pending.clone(),
            queue_tx,
        ));

        let mut subscriptions = self.subscriptions();
        subscriptions.active.insert(
            id.clone(),
            ActiveSubscription {
                topic_id: topic_id.to_string(),
                reader,
                worker,
            },
        );
        subscriptions
            .latest_by_topic
            .insert(topic_id.to_string(), id.clone());

        tracing::info!(topic_id = %topic_id, subscription_id = %id, "Subscribed to topic");
        Ok(id)
    }

    /// Stop a subscription. Envelopes already queued still reach handlers.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions();
        let Some(active) = subscriptions.active.remove(id) else {
            return false;
        };
        if subscriptions.latest_by_topic.get(&active.topic_id) == Some(id) {
            subscriptions.latest_by_topic.remove(&active.topic_id);
        }
        drop(subscriptions);

        // Dropping the reader closes the queue; the worker exits once drained.
        active.reader.abort();
        tracing::info!(topic_id = %active.topic_id, subscription_id = %id, "Unsubscribed");
        true
    }

    /// Most recent live subscription opened for a topic.
    pub fn subscription_for(&self, topic_id: &str) -> Option<SubscriptionId> {
        self.subscriptions().latest_by_topic.get(topic_id).cloned()
    }

    /// All live subscriptions with their topics.
    pub fn subscriptions_list(&self) -> Vec<(SubscriptionId, String)> {
        self.subscriptions()
            .active
            .iter()
            .map(|(id, s)| (id.clone(), s.topic_id.clone()))
            .collect()
    }

    /// Stop every subscription immediately, queued envelopes included.
    pub fn shutdown(&self) -> usize {
        let mut subscriptions = self.subscriptions();
        subscriptions.latest_by_topic.clear();
        let drained: Vec<ActiveSubscription> =
            subscriptions.active.drain().map(|(_, s)| s).collect();
        drop(subscriptions);

        for active in &drained {
            active.reader.abort();
            active.worker.abort();
        }
        drained.len()
    }

    /// Register a handler for envelopes whose `topicId` is `topic_id`.
    pub fn add_handler(&self, topic_id: &str, handler: HandlerRef) {
        tracing::info!(topic_id = %topic_id, "Adding message handler");
        self.handlers.add(topic_id, handler);
    }

    /// Remove the first registration of `handler` on `topic_id`.
    pub fn remove_handler(&self, topic_id: &str, handler: &HandlerRef) -> bool {
        tracing::info!(topic_id = %topic_id, "Removing message handler");
        self.handlers.remove(topic_id, handler)
    }

    /// The shared handler registry.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reader task: decode, correlate, forward to the handler worker.
async fn read_deliveries(
    subscription_id: SubscriptionId,
    mut stream: DeliveryStream,
    format: WireFormat,
    pending: Arc<PendingRequests>,
    queue: mpsc::UnboundedSender<Envelope>,
) {
    while let Some(delivery) = stream.recv().await {
        let envelope = match Envelope::decode(&delivery.contents, format) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    sequence_number = delivery.sequence_number,
                    "Dropping message: {}",
                    e
                );
                continue;
            }
        };

        tracing::debug!(
            subscription_id = %subscription_id,
            message_id = %envelope.id,
            kind = %envelope.kind(),
            sequence_number = delivery.sequence_number,
            delivered_at = %delivery.delivered_at,
            "Received message"
        );

        correlate(&pending, &envelope);

        if queue.send(envelope).is_err() {
            break;
        }
    }

    tracing::debug!(subscription_id = %subscription_id, "Delivery stream ended");
}

/// Hand a response to its waiting request, if one is still pending.
fn correlate(pending: &PendingRequests, envelope: &Envelope) {
    if let Body::Response { correlation_id, .. } = &envelope.body {
        if pending.complete(correlation_id, envelope.clone()) {
            tracing::info!(request_id = %correlation_id, "Resolved pending request");
        } else {
            tracing::debug!(request_id = %correlation_id, "No pending request for response");
        }
    }
}

/// Handler worker: one envelope at a time, in queue order.
async fn run_handlers(handlers: Arc<HandlerRegistry>, mut queue: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = queue.recv().await {
        handlers.dispatch(&envelope).await;
    }
}
