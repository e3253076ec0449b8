//! Inbound frame routing.
//!
//! Every text frame coming off the socket passes through here exactly once:
//! malformed JSON is dropped with a warning, correlated responses are handed
//! to their waiting request, and everything else is decoded into a typed
//! [`InboundMessage`] and fanned out to the subscribers registered for its
//! kind.

use crate::request::PendingRequests;
use lumi_protocol::{InboundMessage, MessageKind};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Handle for removing a subscriber.
pub type SubscriberId = u64;

type Handler = Box<dyn Fn(&InboundMessage) -> anyhow::Result<()> + Send>;

/// Routes decoded frames to per-kind subscribers, with correlated responses
/// intercepted before broadcast.
pub struct MessageRouter {
    subscribers: HashMap<MessageKind, Vec<(SubscriberId, Handler)>>,
    next_id: SubscriberId,
    pending: PendingRequests,
}

impl MessageRouter {
    pub fn new(pending: PendingRequests) -> Self {
        Self {
            subscribers: HashMap::new(),
            next_id: 0,
            pending,
        }
    }

    /// Registers `handler` for every inbound frame of `kind`. Handlers for
    /// the same kind run in registration order.
    pub fn on<F>(&mut self, kind: MessageKind, handler: F) -> SubscriberId
    where
        F: Fn(&InboundMessage) -> anyhow::Result<()> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers
            .entry(kind)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Removes a subscriber. Unknown ids are ignored.
    pub fn off(&mut self, kind: MessageKind, id: SubscriberId) {
        if let Some(handlers) = self.subscribers.get_mut(&kind) {
            handlers.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    /// Processes one raw text frame.
    ///
    /// Returns the decoded message when the frame was broadcast, `None` when
    /// it was dropped or consumed as a correlated response. A failing
    /// subscriber is logged and never blocks the remaining subscribers.
    pub fn dispatch(&self, raw: &str) -> Option<InboundMessage> {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return None;
            }
        };

        // Correlated responses go to their waiter, not to subscribers.
        if let Some(request_id) = value.get("requestId").and_then(|v| v.as_str()) {
            let request_id = request_id.to_string();
            if !self.pending.resolve(&request_id, value) {
                debug!(request_id, "correlated response had no waiter");
            }
            return None;
        }

        let message: InboundMessage = match serde_json::from_value(value.clone()) {
            Ok(message) => message,
            Err(e) => {
                let frame_type = value
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("<missing>");
                warn!(frame_type, error = %e, "dropping unrecognized frame");
                return None;
            }
        };

        if let Some(handlers) = self.subscribers.get(&message.kind()) {
            for (id, handler) in handlers {
                if let Err(e) = handler(&message) {
                    warn!(subscriber = id, error = %e, "subscriber failed");
                }
            }
        }
        Some(message)
    }
}
