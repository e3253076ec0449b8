//! Value types carried inside protocol frames.

use serde::{Deserialize, Serialize};

/// A fragment of an AI turn's display text, tagged for in-order reassembly.
///
/// `segment_order` is the authoritative ordering key; backends that omit it
/// rely on arrival order instead (the aggregator falls back to the count of
/// segments accumulated so far).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DisplayText {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl DisplayText {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            segment_id: None,
            segment_order: None,
            name: None,
            avatar: None,
        }
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.segment_order = Some(order);
        self
    }
}

/// Avatar directives piggybacked on an `audio` frame.
///
/// Only expression indices are interpreted by the session layer; anything
/// else the backend attaches is ignored.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Actions {
    #[serde(default)]
    pub expressions: Vec<i64>,
}

/// One entry of the backend's history list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistorySummary {
    pub uid: String,
    /// Preview of the most recent message, if the backend provides one.
    #[serde(default)]
    pub latest_message: Option<String>,
    /// Backend-formatted timestamp, kept opaque.
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// One message of a hydrated history, as the backend stores it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

impl HistoryEntry {
    /// The backend identity of this entry, preferring the explicit
    /// `message_id` over the generic `id`.
    pub fn backend_id(&self) -> Option<&str> {
        self.message_id.as_deref().or(self.id.as_deref())
    }
}

/// The character configuration announced by `set-model-and-conf`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CharacterConfig {
    pub conf_name: String,
    #[serde(default)]
    pub conf_uid: Option<String>,
    /// Avatar model description, opaque to the session layer and handed to
    /// the rendering engine as-is.
    #[serde(default)]
    pub model_info: Option<serde_json::Value>,
}

/// Control signals delivered via `control` frames.
///
/// New backend signals must not kill the frame, so unrecognized values are
/// preserved as [`ControlSignal::Other`] instead of failing deserialization.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "String", into = "String")]
pub enum ControlSignal {
    StartMic,
    Interrupt,
    MicAudioEnd,
    ConversationChainStart,
    ConversationChainEnd,
    Other(String),
}

impl From<String> for ControlSignal {
    fn from(s: String) -> Self {
        match s.as_str() {
            "start-mic" => ControlSignal::StartMic,
            "interrupt" => ControlSignal::Interrupt,
            "mic-audio-end" => ControlSignal::MicAudioEnd,
            "conversation-chain-start" => ControlSignal::ConversationChainStart,
            "conversation-chain-end" => ControlSignal::ConversationChainEnd,
            _ => ControlSignal::Other(s),
        }
    }
}

impl From<ControlSignal> for String {
    fn from(signal: ControlSignal) -> Self {
        match signal {
            ControlSignal::StartMic => "start-mic".into(),
            ControlSignal::Interrupt => "interrupt".into(),
            ControlSignal::MicAudioEnd => "mic-audio-end".into(),
            ControlSignal::ConversationChainStart => "conversation-chain-start".into(),
            ControlSignal::ConversationChainEnd => "conversation-chain-end".into(),
            ControlSignal::Other(s) => s,
        }
    }
}

/// AI activity states pushed by `ai-status` frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "String", into = "String")]
pub enum AiStatus {
    Idle,
    Loading,
    Listening,
    Waiting,
    ThinkingSpeaking,
    Interrupted,
    Other(String),
}

impl From<String> for AiStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "idle" => AiStatus::Idle,
            "loading" => AiStatus::Loading,
            "listening" => AiStatus::Listening,
            "waiting" => AiStatus::Waiting,
            "thinking_speaking" => AiStatus::ThinkingSpeaking,
            "interrupted" => AiStatus::Interrupted,
            _ => AiStatus::Other(s),
        }
    }
}

impl From<AiStatus> for String {
    fn from(status: AiStatus) -> Self {
        match status {
            AiStatus::Idle => "idle".into(),
            AiStatus::Loading => "loading".into(),
            AiStatus::Listening => "listening".into(),
            AiStatus::Waiting => "waiting".into(),
            AiStatus::ThinkingSpeaking => "thinking_speaking".into(),
            AiStatus::Interrupted => "interrupted".into(),
            AiStatus::Other(s) => s,
        }
    }
}
