//! In-process ordered broadcast transport.
//!
//! Each topic keeps its full message log. Subscribers get every message
//! submitted after they subscribe, in submission order; a subscription with a
//! start time first replays the logged messages delivered at or after it.
//!
//! # Example
//!
//! ```
//! use hcs10_client::transport::{MemoryTransport, Transport};
//! use bytes::Bytes;
//!
//! # tokio_test_block(async {
//! let transport = MemoryTransport::new();
//! let topic = transport.create_topic(Some("demo"));
//! let mut stream = transport.subscribe(&topic, None).await.unwrap();
//!
//! transport.submit(&topic, Bytes::from_static(b"hello")).await.unwrap();
//! let delivery = stream.recv().await.unwrap();
//! assert_eq!(&delivery.contents[..], b"hello");
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f);
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;

use super::{Delivery, DeliveryStream, TransactionId, Transport};
use crate::error::{Hcs10Error, Result};
use crate::handler::BoxFuture;

/// First topic number handed out by [`MemoryTransport::create_topic`].
const FIRST_TOPIC_NUM: u64 = 1001;

/// In-process transport. Cheaply cloneable; clones share all topics.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    next_topic_num: u64,
    fail_submits: bool,
    closed: bool,
}

#[derive(Default)]
struct TopicLog {
    memo: Option<String>,
    messages: Vec<Delivery>,
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
}

impl MemoryTransport {
    /// Create an empty transport with no topics.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a topic and return its id (`0.0.N`).
    pub fn create_topic(&self, memo: Option<&str>) -> String {
        let mut state = self.state();
        let num = FIRST_TOPIC_NUM + state.next_topic_num;
        state.next_topic_num += 1;

        let topic_id = format!("0.0.{}", num);
        state.topics.insert(
            topic_id.clone(),
            TopicLog {
                memo: memo.map(str::to_string),
                ..TopicLog::default()
            },
        );
        tracing::debug!(topic_id = %topic_id, "Created in-memory topic");
        topic_id
    }

    /// Memo given at creation, if the topic exists and has one.
    pub fn topic_memo(&self, topic_id: &str) -> Option<String> {
        self.state()
            .topics
            .get(topic_id)
            .and_then(|t| t.memo.clone())
    }

    /// Make every following submission fail (or succeed again).
    pub fn fail_submits(&self, fail: bool) {
        self.state().fail_submits = fail;
    }

    /// All messages logged on a topic, in order.
    pub fn messages(&self, topic_id: &str) -> Vec<Delivery> {
        self.state()
            .topics
            .get(topic_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic_id: &str) -> usize {
        self.state()
            .topics
            .get(topic_id)
            .map(|t| t.subscribers.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Whether [`Transport::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn submit_now(&self, topic_id: &str, message: Bytes) -> Result<TransactionId> {
        let mut state = self.state();
        let reject = |reason: &str| Hcs10Error::Transport {
            topic_id: topic_id.to_string(),
            reason: reason.to_string(),
        };

        if state.closed {
            return Err(reject("transport closed"));
        }
        if state.fail_submits {
            return Err(reject("submission rejected"));
        }
        let topic = state
            .topics
            .get_mut(topic_id)
            .ok_or_else(|| reject("unknown topic"))?;

        // Delivery times are strictly increasing within a topic.
        let mut delivered_at = Utc::now();
        if let Some(last) = topic.messages.last() {
            if delivered_at <= last.delivered_at {
                delivered_at = last.delivered_at + Duration::nanoseconds(1);
            }
        }

        let delivery = Delivery {
            contents: message,
            delivered_at,
            sequence_number: topic.messages.len() as u64 + 1,
        };
        topic
            .subscribers
            .retain(|tx| tx.send(delivery.clone()).is_ok());
        topic.messages.push(delivery);

        Ok(format!(
            "{}@{}.{:09}",
            topic_id,
            delivered_at.timestamp(),
            delivered_at.timestamp_subsec_nanos()
        ))
    }

    fn subscribe_now(
        &self,
        topic_id: &str,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<DeliveryStream> {
        let mut state = self.state();
        let reject = |reason: &str| Hcs10Error::Subscription {
            topic_id: topic_id.to_string(),
            reason: reason.to_string(),
        };

        if state.closed {
            return Err(reject("transport closed"));
        }
        let topic = state
            .topics
            .get_mut(topic_id)
            .ok_or_else(|| reject("unknown topic"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(start) = start_time {
            for delivery in topic.messages.iter().filter(|d| d.delivered_at >= start) {
                // Receiver is alive: it is still in our hands.
                let _ = tx.send(delivery.clone());
            }
        }
        topic.subscribers.push(tx);
        Ok(rx)
    }
}

impl Transport for MemoryTransport {
    fn submit<'a>(
        &'a self,
        topic_id: &'a str,
        message: Bytes,
    ) -> BoxFuture<'a, Result<TransactionId>> {
        Box::pin(async move { self.submit_now(topic_id, message) })
    }

    fn subscribe<'a>(
        &'a self,
        topic_id: &'a str,
        start_time: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<DeliveryStream>> {
        Box::pin(async move { self.subscribe_now(topic_id, start_time) })
    }

    fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        for topic in state.topics.values_mut() {
            topic.subscribers.clear();
        }
    }
}
