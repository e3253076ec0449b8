//! The in-memory conversation log.
//!
//! Messages carry an engine-local id that stays stable across segment
//! arrivals, status transitions, and backend re-sends. Adding a message whose
//! backend id is already present updates the existing entry instead of
//! duplicating it, so redelivered history is idempotent.

use chrono::{DateTime, Utc};
use lumi_protocol::{HistoryEntry, HistorySummary};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub type MessageId = String;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a log-unique message id: millisecond timestamp, process-wide
/// counter, and a random suffix.
fn generate_id() -> MessageId {
    format!(
        "msg_{}_{}_{:08x}",
        Utc::now().timestamp_millis(),
        ID_COUNTER.fetch_add(1, Ordering::Relaxed),
        rand::random::<u32>()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Ai,
}

/// Delivery state of a message. User messages move Sending -> Sent (or
/// Failed); AI messages arrive Received and become Saved once their turn is
/// persisted by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Sending,
    Sent,
    Failed,
    Received,
    Saved,
}

/// One reassembly fragment of a streamed AI message.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub order: u32,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    /// Identity assigned by the backend, when it sent one.
    pub backend_id: Option<String>,
    pub sender: Sender,
    pub content: String,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    /// Base64 audio payload of the latest audio-bearing segment.
    pub audio: Option<String>,
    pub segments: Vec<Segment>,
    /// True while the AI turn that produces this message is still open.
    pub is_streaming: bool,
}

impl Message {
    fn new(sender: Sender, content: String, status: MessageStatus) -> Self {
        Self {
            id: generate_id(),
            backend_id: None,
            sender,
            content,
            status,
            timestamp: Utc::now(),
            audio: None,
            segments: Vec::new(),
            is_streaming: false,
        }
    }

    /// Applies one display-text segment.
    ///
    /// The effective order is the explicit `segment_order` when present,
    /// otherwise the count of segments accumulated so far. A segment whose
    /// order or text matches one already applied is a redelivery and is
    /// ignored. Returns whether the content changed.
    pub fn apply_segment(&mut self, text: &str, explicit_order: Option<u32>) -> bool {
        let order = explicit_order.unwrap_or(self.segments.len() as u32);
        let duplicate = self
            .segments
            .iter()
            .any(|s| s.order == order || s.text == text);
        if duplicate {
            debug!(order, "duplicate segment ignored");
            return false;
        }
        self.segments.push(Segment {
            order,
            text: text.to_string(),
            received_at: Utc::now(),
        });
        self.rebuild_content();
        true
    }

    /// Rebuilds the displayed content from segments sorted by order. Arrival
    /// order never matters once every segment is in.
    fn rebuild_content(&mut self) {
        let mut segments: Vec<&Segment> = self.segments.iter().collect();
        segments.sort_by_key(|s| s.order);
        self.content = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<String>();
    }
}

/// What a caller supplies when appending a message.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub sender: Sender,
    pub content: String,
    pub status: MessageStatus,
    pub backend_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageDraft {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            content: content.into(),
            status: MessageStatus::Sending,
            backend_id: None,
            timestamp: None,
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self {
            sender: Sender::Ai,
            content: content.into(),
            status: MessageStatus::Received,
            backend_id: None,
            timestamp: None,
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_backend_id(mut self, id: impl Into<String>) -> Self {
        self.backend_id = Some(id.into());
        self
    }
}

/// The session's message log plus the cached history catalogue.
pub struct ConversationLog {
    messages: Vec<Message>,
    history_list: Vec<HistorySummary>,
    current_history: Option<String>,
    max_messages: usize,
}

impl ConversationLog {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            history_list: Vec::new(),
            current_history: None,
            max_messages,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn history_list(&self) -> &[HistorySummary] {
        &self.history_list
    }

    pub fn current_history(&self) -> Option<&str> {
        self.current_history.as_deref()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Appends a message, or updates the existing one when the draft carries
    /// a backend id the log already knows. Returns the message's engine id.
    pub fn add(&mut self, draft: MessageDraft) -> MessageId {
        if let Some(backend_id) = &draft.backend_id {
            let existing = self.messages.iter_mut().find(|m| {
                m.id == *backend_id || m.backend_id.as_deref() == Some(backend_id.as_str())
            });
            if let Some(message) = existing {
                // Redelivery: later non-empty fields win, identity is kept.
                if !draft.content.is_empty() {
                    message.content = draft.content;
                }
                message.status = draft.status;
                if let Some(ts) = draft.timestamp {
                    message.timestamp = ts;
                }
                return message.id.clone();
            }
        }

        let mut message = Message::new(draft.sender, draft.content, draft.status);
        if let Some(backend_id) = draft.backend_id {
            // A backend-identified message keeps that identity as its own.
            message.id = self.unique_id(backend_id.clone());
            message.backend_id = Some(backend_id);
        } else {
            while self.messages.iter().any(|m| m.id == message.id) {
                message.id = generate_id();
            }
        }
        if let Some(ts) = draft.timestamp {
            message.timestamp = ts;
        }
        let id = message.id.clone();
        self.messages.push(message);
        self.evict_overflow();
        id
    }

    fn unique_id(&self, candidate: String) -> MessageId {
        if self.messages.iter().any(|m| m.id == candidate) {
            generate_id()
        } else {
            candidate
        }
    }

    fn evict_overflow(&mut self) {
        while self.messages.len() > self.max_messages {
            let evicted = self.messages.remove(0);
            debug!(id = %evicted.id, "evicted oldest message");
        }
    }

    /// Returns the open streaming AI message at the tail of the log, starting
    /// a new one when the tail is absent, a user message, or already closed.
    pub fn open_or_begin_turn(&mut self) -> &mut Message {
        let needs_new = !matches!(
            self.messages.last(),
            Some(m) if m.sender == Sender::Ai && m.is_streaming
        );
        if needs_new {
            let mut message = Message::new(Sender::Ai, String::new(), MessageStatus::Received);
            message.is_streaming = true;
            self.messages.push(message);
            self.evict_overflow();
        }
        let idx = self.messages.len() - 1;
        &mut self.messages[idx]
    }

    /// Closes the open AI turn, if any, marking it `status`. Returns its id.
    pub fn close_turn(&mut self, status: MessageStatus) -> Option<MessageId> {
        let message = self
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.sender == Sender::Ai && m.is_streaming)?;
        message.is_streaming = false;
        message.status = status;
        Some(message.id.clone())
    }

    /// Replaces the log with a hydrated backend history.
    pub fn load_history(&mut self, entries: &[HistoryEntry]) {
        self.messages.clear();
        for entry in entries {
            let sender = match entry.role.as_str() {
                "user" | "human" => Sender::User,
                _ => Sender::Ai,
            };
            let timestamp = entry
                .timestamp
                .as_deref()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc));
            self.add(MessageDraft {
                sender,
                content: entry.content.clone(),
                status: MessageStatus::Saved,
                backend_id: entry.backend_id().map(str::to_string),
                timestamp,
            });
        }
    }

    pub fn set_history_list(&mut self, histories: Vec<HistorySummary>) {
        self.history_list = histories;
    }

    pub fn set_current_history(&mut self, uid: Option<String>) {
        self.current_history = uid;
    }

    /// A freshly created history becomes current with an empty log.
    pub fn created_history(&mut self, uid: String) {
        self.messages.clear();
        self.current_history = Some(uid);
    }

    /// Drops a deleted history from the cache; clears the log when it was
    /// the active one.
    pub fn deleted_history(&mut self, uid: &str) {
        self.history_list.retain(|h| h.uid != uid);
        if self.current_history.as_deref() == Some(uid) {
            self.messages.clear();
            self.current_history = None;
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
