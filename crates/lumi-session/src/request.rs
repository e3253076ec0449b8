//! Request/response correlation over the one-way frame stream.
//!
//! The wire protocol has no native RPC: a caller that needs a reply attaches
//! a `requestId` to its outbound frame and the backend echoes the same id on
//! the response. This module keeps the table of waiting callers; the router
//! consults it before broadcasting an inbound frame.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

/// Shared table of in-flight correlated requests.
///
/// Cheap to clone; all clones observe the same table.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `request_id` and returns the receiving half.
    ///
    /// Re-registering the same id replaces the previous waiter, whose
    /// receiver then resolves as cancelled.
    pub fn register(&self, request_id: impl Into<String>) -> oneshot::Receiver<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        table.insert(request_id.into(), tx);
        rx
    }

    /// Delivers a response to its waiter. Returns false when no waiter is
    /// registered (already timed out or never requested).
    pub fn resolve(&self, request_id: &str, response: serde_json::Value) -> bool {
        let sender = {
            let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            table.remove(request_id)
        };
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(request_id, "response for unknown request dropped");
                false
            }
        }
    }

    /// Forgets a waiter, typically after its timeout fired.
    pub fn remove(&self, request_id: &str) {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        table.remove(request_id);
    }

    /// Cancels every in-flight request. Their receivers resolve with a recv
    /// error, which callers surface as a cancelled operation.
    pub fn fail_all(&self) {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let count = table.len();
        table.clear();
        if count > 0 {
            debug!(count, "cancelled in-flight requests");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
