//! Pending-request table.
//!
//! Maps a correlation id (the request's envelope id) to the waiter for its
//! response. Every entry owns a timer task; an entry leaves the table exactly
//! once, through one of:
//!
//! - [`complete`](PendingRequests::complete) - a matching response arrived
//! - the timer - the waiter fails with [`Hcs10Error::RequestTimeout`]
//! - [`cancel`](PendingRequests::cancel) - the request never went out
//! - [`fail_all`](PendingRequests::fail_all) - the client is closing
//!
//! Whichever path removes the entry aborts the timer. A timer that fires
//! after its entry is gone finds nothing and does nothing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::envelope::Envelope;
use crate::error::{Hcs10Error, Result};

/// Longest wait a request can be given (about 30 years).
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(86_400 * 365 * 30);

type Entries = Arc<Mutex<HashMap<String, PendingEntry>>>;

struct PendingEntry {
    tx: oneshot::Sender<Result<Envelope>>,
    deadline: Instant,
    timer: JoinHandle<()>,
}

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-flight requests awaiting a response.
#[derive(Default)]
pub struct PendingRequests {
    entries: Entries,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry for `id` that expires after `timeout`.
    ///
    /// Timeouts longer than [`MAX_REQUEST_TIMEOUT`] are clamped to it, so
    /// `Duration::MAX` reads as "never".
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, id: &str, timeout: Duration) -> Result<PendingResponse> {
        let timeout = timeout.min(MAX_REQUEST_TIMEOUT);
        let deadline = Instant::now() + timeout;

        let mut entries = lock(&self.entries);
        if entries.contains_key(id) {
            return Err(Hcs10Error::DuplicateRequest(id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        // The timer cannot observe the table before the insert below: it
        // needs this same lock.
        let timer = tokio::spawn(expire(self.entries.clone(), id.to_string(), timeout));
        entries.insert(
            id.to_string(),
            PendingEntry {
                tx,
                deadline,
                timer,
            },
        );

        Ok(PendingResponse {
            id: id.to_string(),
            rx,
        })
    }

    /// Resolve the entry for `id` with `response`.
    ///
    /// Returns `false` when there is no such entry (late or duplicate response).
    pub fn complete(&self, id: &str, response: Envelope) -> bool {
        let Some(entry) = lock(&self.entries).remove(id) else {
            return false;
        };
        entry.timer.abort();
        // The waiter may have given up; that is not an error here.
        let _ = entry.tx.send(Ok(response));
        true
    }

    /// Drop the entry for `id` without resolving it.
    pub fn cancel(&self, id: &str) -> bool {
        match lock(&self.entries).remove(id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Fail every entry with [`Hcs10Error::ClientClosed`]. Returns how many.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<(String, PendingEntry)> = lock(&self.entries).drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.timer.abort();
            tracing::debug!(request_id = %id, "Failing pending request on close");
            let _ = entry.tx.send(Err(Hcs10Error::ClientClosed));
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.entries).contains_key(id)
    }

    /// Deadline of the entry for `id`.
    pub fn deadline(&self, id: &str) -> Option<Instant> {
        lock(&self.entries).get(id).map(|e| e.deadline)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

async fn expire(entries: Entries, id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    let Some(entry) = lock(&entries).remove(&id) else {
        return;
    };
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    tracing::warn!(request_id = %id, timeout_ms, "Request timed out");
    let _ = entry
        .tx
        .send(Err(Hcs10Error::RequestTimeout { id, timeout_ms }));
}

/// Future resolving to the response for one registered request.
///
/// Resolves to [`Hcs10Error::ClientClosed`] if the entry is dropped without
/// being completed.
#[derive(Debug)]
pub struct PendingResponse {
    id: String,
    rx: oneshot::Receiver<Result<Envelope>>,
}

impl PendingResponse {
    /// Correlation id this future waits on.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingResponse {
    type Output = Result<Envelope>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Hcs10Error::ClientClosed)))
    }
}
