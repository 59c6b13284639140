//! Handler registry keyed by topic.
//!
//! Each topic has an ordered list of handlers. Order of registration is the
//! order of invocation; the same handler may be registered more than once.
//! Removal matches by `Arc` identity and takes the first occurrence.
//!
//! # Example
//!
//! ```
//! use hcs10_client::handler::{handler_fn, HandlerRegistry};
//!
//! let registry = HandlerRegistry::new();
//! let handler = handler_fn(|envelope| async move {
//!     println!("got {}", envelope.id);
//!     Ok(())
//! });
//!
//! registry.add("0.0.1001", handler.clone());
//! assert_eq!(registry.handler_count("0.0.1001"), 1);
//! assert!(registry.remove("0.0.1001", &handler));
//! assert!(!registry.remove("0.0.1001", &handler));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::envelope::Envelope;
use crate::error::Result;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capability invoked for every envelope delivered on a topic.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one envelope.
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, HandlerResult>;
}

/// Shared handle to a registered handler. Identity is the `Arc` pointer.
pub type HandlerRef = Arc<dyn MessageHandler>;

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new closure handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(envelope))
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(handler: F) -> HandlerRef
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler::new(handler))
}

fn same_handler(a: &HandlerRef, b: &HandlerRef) -> bool {
    // Data pointers only: vtable pointers are not guaranteed unique.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Outcome of fanning one envelope out to a topic's handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Handlers invoked.
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

/// Registry mapping topics to their handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Vec<HandlerRef>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<String, Vec<HandlerRef>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a handler to a topic's list.
    pub fn add(&self, topic_id: &str, handler: HandlerRef) {
        self.handlers()
            .entry(topic_id.to_string())
            .or_default()
            .push(handler);
    }

    /// Remove the first occurrence of `handler` from a topic.
    ///
    /// Returns `false` if it was not registered there.
    pub fn remove(&self, topic_id: &str, handler: &HandlerRef) -> bool {
        let mut handlers = self.handlers();
        let Some(list) = handlers.get_mut(topic_id) else {
            return false;
        };
        let Some(index) = list.iter().position(|h| same_handler(h, handler)) else {
            return false;
        };

        list.remove(index);
        if list.is_empty() {
            handlers.remove(topic_id);
        }
        true
    }

    /// Snapshot of a topic's handlers in registration order.
    pub fn handlers_for(&self, topic_id: &str) -> Vec<HandlerRef> {
        self.handlers()
            .get(topic_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of handlers registered on a topic.
    pub fn handler_count(&self, topic_id: &str) -> usize {
        self.handlers().get(topic_id).map_or(0, Vec::len)
    }

    /// Drop every registration. Returns how many handlers were removed.
    pub fn clear(&self) -> usize {
        let drained: Vec<Vec<HandlerRef>> = self.handlers().drain().map(|(_, list)| list).collect();
        drained.iter().map(Vec::len).sum()
    }

    /// Topics with at least one handler.
    pub fn topics(&self) -> Vec<String> {
        self.handlers().keys().cloned().collect()
    }

    /// Invoke every handler for the envelope's topic, in order.
    ///
    /// Each handler runs to completion before the next starts. Errors and
    /// panics are logged and counted; they never stop the remaining handlers.
    pub async fn dispatch(&self, envelope: &Envelope) -> DispatchSummary {
        let handlers = self.handlers_for(&envelope.topic_id);
        let mut summary = DispatchSummary::default();

        for handler in handlers {
            summary.invoked += 1;
            // Spawned so a panicking handler is contained in its own task.
            let outcome = tokio::spawn(handler.handle(envelope.clone())).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    summary.failed += 1;
                    tracing::error!(
                        topic_id = %envelope.topic_id,
                        message_id = %envelope.id,
                        "Handler error: {}",
                        e
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        topic_id = %envelope.topic_id,
                        message_id = %envelope.id,
                        "Handler panicked: {}",
                        e
                    );
                }
            }
        }

        summary
    }
}
