//! Handler module - per-topic envelope handlers.
//!
//! Provides:
//! - [`MessageHandler`] - the capability invoked for each delivered envelope
//! - [`handler_fn`] - adapter for async closures
//! - [`HandlerRegistry`] - ordered handler lists keyed by topic
//!
//! # Example
//!
//! ```ignore
//! use hcs10_client::handler::handler_fn;
//!
//! let log_all = handler_fn(|envelope| async move {
//!     tracing::info!("{} on {}", envelope.kind(), envelope.topic_id);
//!     Ok(())
//! });
//! client.add_handler(&topic_id, log_all.clone());
//! ```

mod registry;

pub use registry::{
    handler_fn, BoxFuture, DispatchSummary, FnHandler, HandlerRef, HandlerRegistry, HandlerResult,
    MessageHandler,
};
