//! The closed set of typed frames exchanged with the backend.

use crate::types::{
    Actions, CharacterConfig, ControlSignal, DisplayText, HistoryEntry, HistorySummary,
};
use serde::{Deserialize, Serialize};

/// Frames received from the backend.
///
/// The original traffic grows fields ad hoc per message type; here each wire
/// `type` is one variant so a frame either decodes into a known shape or is
/// dropped by the router with a warning.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundMessage {
    /// A complete, non-segmented textual reply. Always terminal for its turn.
    FullText { text: String },
    /// One segment of a spoken reply: optional audio blob (base64, opaque),
    /// optional display text, optional avatar directives.
    Audio {
        #[serde(default)]
        audio: Option<String>,
        #[serde(default)]
        display_text: Option<DisplayText>,
        #[serde(default)]
        actions: Option<Actions>,
    },
    /// Conversation-flow control signal.
    Control { text: ControlSignal },
    /// The history list requested via `fetch-history-list`.
    HistoryList { histories: Vec<HistorySummary> },
    /// A full message log requested via `fetch-and-set-history`.
    HistoryData { messages: Vec<HistoryEntry> },
    /// Connection bootstrap: client identity plus active character config.
    SetModelAndConf {
        #[serde(default)]
        client_uid: Option<String>,
        #[serde(default)]
        conf_name: Option<String>,
        #[serde(default)]
        conf_uid: Option<String>,
        #[serde(default)]
        model_info: Option<serde_json::Value>,
    },
    /// Backend-reported error for the most recent operation.
    Error { message: String },
    /// Close the current AI message even though the turn continues.
    ForceNewMessage,
    /// AI activity state change.
    AiStatus { status: crate::AiStatus },
    /// Available character configuration files.
    ConfigFiles { configs: Vec<serde_json::Value> },
    /// Acknowledges `create-new-history` with the fresh history id.
    NewHistoryCreated { history_uid: String },
    /// Acknowledges `delete-history`.
    HistoryDeleted {
        #[serde(default)]
        success: bool,
        history_uid: String,
    },
    /// Backend finished synthesizing speech; the client confirms playback.
    BackendSynthComplete,
    /// Transcription of the user's speech, echoed back as their message.
    UserInputTranscription { text: String },
    /// Local speech-recognition result relayed by the backend.
    #[serde(rename = "asr_result")]
    AsrResult { text: String },
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::FullText { .. } => MessageKind::FullText,
            InboundMessage::Audio { .. } => MessageKind::Audio,
            InboundMessage::Control { .. } => MessageKind::Control,
            InboundMessage::HistoryList { .. } => MessageKind::HistoryList,
            InboundMessage::HistoryData { .. } => MessageKind::HistoryData,
            InboundMessage::SetModelAndConf { .. } => MessageKind::SetModelAndConf,
            InboundMessage::Error { .. } => MessageKind::Error,
            InboundMessage::ForceNewMessage => MessageKind::ForceNewMessage,
            InboundMessage::AiStatus { .. } => MessageKind::AiStatus,
            InboundMessage::ConfigFiles { .. } => MessageKind::ConfigFiles,
            InboundMessage::NewHistoryCreated { .. } => MessageKind::NewHistoryCreated,
            InboundMessage::HistoryDeleted { .. } => MessageKind::HistoryDeleted,
            InboundMessage::BackendSynthComplete => MessageKind::BackendSynthComplete,
            InboundMessage::UserInputTranscription { .. } => MessageKind::UserInputTranscription,
            InboundMessage::AsrResult { .. } => MessageKind::AsrResult,
        }
    }

    /// The active character config carried by a `set-model-and-conf` frame,
    /// if it names one.
    pub fn character_config(&self) -> Option<CharacterConfig> {
        match self {
            InboundMessage::SetModelAndConf {
                conf_name: Some(name),
                conf_uid,
                model_info,
                ..
            } => Some(CharacterConfig {
                conf_name: name.clone(),
                conf_uid: conf_uid.clone(),
                model_info: model_info.clone(),
            }),
            _ => None,
        }
    }
}

/// Discriminator used for subscriber registration, one per inbound `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    FullText,
    Audio,
    Control,
    HistoryList,
    HistoryData,
    SetModelAndConf,
    Error,
    ForceNewMessage,
    AiStatus,
    ConfigFiles,
    NewHistoryCreated,
    HistoryDeleted,
    BackendSynthComplete,
    UserInputTranscription,
    AsrResult,
}

/// Frames sent to the backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundMessage {
    /// User-typed text input.
    TextInput { text: String },
    /// One sub-chunk of microphone audio, normalized f32 samples.
    MicAudioData { audio: Vec<f32> },
    /// The user stopped speaking.
    MicAudioEnd,
    /// Interrupt the AI's current turn.
    InterruptSignal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    FetchHistoryList,
    FetchAndSetHistory { history_uid: String },
    CreateNewHistory,
    DeleteHistory { history_uid: String },
    FetchConfigs,
    SwitchConfig { file: String },
    /// Confirms playback after `backend-synth-complete`.
    FrontendPlaybackComplete,
}

impl OutboundMessage {
    /// Serializes the frame to its wire form.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
