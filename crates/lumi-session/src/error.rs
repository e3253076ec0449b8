//! Error taxonomy for the session engine.
//!
//! Connection-kind failures are handled by the transport's reconnection
//! policy and only surface to callers through the connection snapshot;
//! Message/Config/History failures are returned to the immediate caller and
//! never alter connection state.

use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("already connecting or connected")]
    AlreadyActive,
    #[error("not connected")]
    NotConnected,
    #[error("failed to encode outbound frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message error: {0}")]
    Message(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("history error: {0}")]
    History(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("session engine has shut down")]
    Closed,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connection(_)
            | SessionError::AlreadyActive
            | SessionError::NotConnected
            | SessionError::Closed => ErrorKind::Connection,
            SessionError::Timeout(_) => ErrorKind::Timeout,
            SessionError::Encode(_) | SessionError::Message(_) => ErrorKind::Message,
            SessionError::Config(_) => ErrorKind::Config,
            SessionError::History(_) => ErrorKind::History,
            SessionError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Coarse error classification used for the best-effort status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Timeout,
    Parse,
    Message,
    Config,
    History,
    Cancelled,
}

/// The most recent failure, kept as a status fact rather than thrown.
#[derive(Debug, Clone, PartialEq)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LastError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn of(err: &SessionError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}
