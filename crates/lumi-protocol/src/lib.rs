//! Wire protocol for the Lumi companion backend.
//!
//! Every text frame exchanged with the backend is a JSON object with a
//! `type` discriminator. This crate models that traffic as two closed enums,
//! [`InboundMessage`] and [`OutboundMessage`], decoded and encoded through a
//! single typed serde step, plus the value types the frames carry. It
//! contains no I/O and no session logic; the `lumi-session` crate owns both.

mod messages;
mod types;

pub use messages::{InboundMessage, MessageKind, OutboundMessage};
pub use types::{
    Actions, AiStatus, CharacterConfig, ControlSignal, DisplayText, HistoryEntry, HistorySummary,
};
