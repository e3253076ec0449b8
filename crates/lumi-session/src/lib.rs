//! Client-side session engine for the realtime conversation protocol.
//!
//! The engine owns a reconnecting WebSocket transport, routes every inbound
//! frame exactly once, reassembles streamed AI replies into a conversation
//! log, and sequences audio playback strictly FIFO. The embedding application
//! drives it through [`Session`] intents and observes it through the
//! [`SessionEvent`] broadcast stream; audio output and avatar rendering are
//! injected via the [`collab`] seams.

pub mod aggregator;
pub mod audio;
pub mod collab;
pub mod config;
pub mod conversation;
pub mod error;
pub mod playback;
pub mod request;
pub mod router;
pub mod session;
pub mod transport;

pub use audio::SampleBuffer;
pub use collab::{AvatarEngine, Collaborators};
pub use config::{ConfigError, ServerConfig, SessionConfig};
pub use conversation::{Message, MessageDraft, MessageId, MessageStatus, Sender};
pub use error::{ErrorKind, LastError, SessionError};
pub use playback::{AudioPlayer, AudioSequencer, AudioTask};
pub use session::{Session, SessionEvent};
pub use transport::{ConnectionSnapshot, ConnectionStatus, DisconnectReason, Transport};

pub use lumi_protocol as protocol;
