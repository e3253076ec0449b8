//! The session engine.
//!
//! [`Session`] wires the transport, router, conversation log, aggregator, and
//! playback sequencer together. One pump task consumes the transport's event
//! stream and applies each frame to the core state under a single lock, so no
//! two frames ever interleave. Everything the engine observes is republished
//! as [`SessionEvent`]s on a broadcast channel for the embedding application.

use crate::aggregator::ResponseAggregator;
use crate::audio::SampleBuffer;
use crate::collab::{AvatarEngine, Collaborators};
use crate::config::SessionConfig;
use crate::conversation::{
    ConversationLog, Message, MessageDraft, MessageId, MessageStatus,
};
use crate::error::{ErrorKind, LastError, SessionError};
use crate::playback::AudioSequencer;
use crate::request::PendingRequests;
use crate::router::{MessageRouter, SubscriberId};
use crate::transport::{
    ConnectionSnapshot, DisconnectReason, Transport, TransportEvent,
};
use lumi_protocol::{
    AiStatus, CharacterConfig, ControlSignal, HistorySummary, InboundMessage, MessageKind,
    OutboundMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything the engine reports to the embedding application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    ReconnectScheduled { attempt: u32, delay: Duration },
    RetriesExhausted,
    /// A message's content, audio, or status changed.
    MessageUpdated { id: MessageId },
    /// An AI turn closed (chain end, full text, force-new, or interrupt).
    MessageFinalized { id: MessageId },
    HistoryListUpdated,
    HistoryChanged { uid: String },
    ConfigUpdated,
    AiStatusChanged(AiStatus),
    BackendError { message: String },
    /// The backend wants the microphone opened / released.
    MicStart,
    MicStop,
    /// The user's speech was transcribed and appended to the log.
    UserTranscription { id: MessageId, text: String },
    /// A raw binary frame, passed through untouched.
    RawAudio(Vec<u8>),
    /// An avatar expression directive from the reply stream.
    Expression(i64),
    /// A playback task finished (never fires for cleared tasks).
    AudioTaskCompleted { task_id: u64 },
}

/// Mutable state shared between the pump task and the intent methods.
struct Core {
    conversation: ConversationLog,
    aggregator: ResponseAggregator,
    router: MessageRouter,
    client_uid: Option<String>,
    character: Option<CharacterConfig>,
    ai_status: AiStatus,
    last_error: Option<LastError>,
    /// One history bootstrap per connection, armed on every (re)connect.
    bootstrapped: bool,
    config_files: Vec<serde_json::Value>,
}

/// Handle to a running session engine. Dropping it stops the pump; the
/// transport actor winds down once every clone of its handle is gone.
pub struct Session {
    transport: Transport,
    core: Arc<Mutex<Core>>,
    pending: PendingRequests,
    sequencer: Arc<AudioSequencer>,
    events: broadcast::Sender<SessionEvent>,
    config: SessionConfig,
    pump: JoinHandle<()>,
}

impl Session {
    /// Constructs the whole engine and spawns its pump task. Nothing talks to
    /// the network until [`connect`](Self::connect).
    pub fn spawn(config: SessionConfig, collaborators: Collaborators) -> Self {
        let pending = PendingRequests::new();
        let (transport, transport_events) = Transport::new(&config);
        let sequencer = Arc::new(AudioSequencer::new(
            collaborators.audio.clone(),
            config.audio_task_gap,
            config.stop_audio_on_clear,
        ));
        let (events, _) = broadcast::channel(256);

        let hook_events = events.clone();
        sequencer.set_on_complete(move |task| {
            let _ = hook_events.send(SessionEvent::AudioTaskCompleted { task_id: task.id });
        });

        let core = Arc::new(Mutex::new(Core {
            conversation: ConversationLog::new(config.max_messages),
            aggregator: ResponseAggregator::new(),
            router: MessageRouter::new(pending.clone()),
            client_uid: None,
            character: None,
            ai_status: AiStatus::Idle,
            last_error: None,
            bootstrapped: false,
            config_files: Vec::new(),
        }));

        let pump = Pump {
            transport: transport.clone(),
            core: core.clone(),
            pending: pending.clone(),
            sequencer: sequencer.clone(),
            events: events.clone(),
            avatar: collaborators.avatar,
        };
        let pump = tokio::spawn(pump.run(transport_events));

        Self {
            transport,
            core,
            pending,
            sequencer,
            events,
            config,
            pump,
        }
    }

    /// Opens the connection and issues the initial history/config fetches.
    /// A failed fetch is surfaced but leaves the connection open.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.transport.connect().await?;

        let mut failures = Vec::new();
        for frame in [
            OutboundMessage::FetchHistoryList,
            OutboundMessage::FetchConfigs,
        ] {
            if let Err(e) = self.send(frame).await {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SessionError::Message(failures.join("; ")))
        }
    }

    /// Closes the connection without scheduling reconnects. In-flight
    /// correlated requests fail with Cancelled.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.transport.disconnect().await?;
        self.pending.fail_all();
        Ok(())
    }

    /// Sends user text. The message enters the log as Sending and moves to
    /// Sent or Failed with the frame's fate; its id is returned on success.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<MessageId, SessionError> {
        let text = text.into();
        let id = {
            let mut core = self.core.lock().await;
            core.conversation.add(MessageDraft::user(text.clone()))
        };
        let _ = self.events.send(SessionEvent::MessageUpdated { id: id.clone() });

        let result = self.send(OutboundMessage::TextInput { text }).await;
        let status = if result.is_ok() {
            MessageStatus::Sent
        } else {
            MessageStatus::Failed
        };
        {
            let mut core = self.core.lock().await;
            if let Some(message) = core.conversation.get_mut(&id) {
                message.status = status;
            }
        }
        let _ = self.events.send(SessionEvent::MessageUpdated { id: id.clone() });
        result.map(|_| id)
    }

    /// Streams one captured buffer as `mic-audio-data` frames of at most
    /// `audio_chunk_size` samples. The first failed frame aborts the rest.
    pub async fn send_audio_chunk(&self, buffer: SampleBuffer) -> Result<(), SessionError> {
        let samples = buffer.into_f32();
        for chunk in samples.chunks(self.config.audio_chunk_size) {
            self.send(OutboundMessage::MicAudioData {
                audio: chunk.to_vec(),
            })
            .await?;
        }
        Ok(())
    }

    /// Tells the backend the user stopped speaking.
    pub async fn send_audio_end(&self) -> Result<(), SessionError> {
        self.send(OutboundMessage::MicAudioEnd).await
    }

    /// Captured speech ended: flush the remaining samples, then the end mark.
    pub async fn handle_speech_end(&self, buffer: SampleBuffer) -> Result<(), SessionError> {
        self.send_audio_chunk(buffer).await?;
        self.send_audio_end().await
    }

    /// Interrupts the AI's current turn: notifies the backend, drops queued
    /// playback, and closes the open message.
    pub async fn send_interrupt(&self, heard: Option<String>) -> Result<(), SessionError> {
        let result = self.send(OutboundMessage::InterruptSignal { text: heard }).await;
        self.sequencer.clear();
        {
            let mut core = self.core.lock().await;
            let core = &mut *core;
            let closed = core
                .aggregator
                .finalize(&mut core.conversation, MessageStatus::Received);
            core.ai_status = AiStatus::Interrupted;
            if let Some(id) = closed {
                let _ = self.events.send(SessionEvent::MessageFinalized { id });
            }
        }
        let _ = self
            .events
            .send(SessionEvent::AiStatusChanged(AiStatus::Interrupted));
        result
    }

    pub async fn fetch_history_list(&self) -> Result<(), SessionError> {
        self.send(OutboundMessage::FetchHistoryList).await
    }

    /// Makes `uid` the active history and asks the backend for its messages.
    pub async fn load_history(&self, uid: impl Into<String>) -> Result<(), SessionError> {
        let uid = uid.into();
        {
            let mut core = self.core.lock().await;
            core.conversation.set_current_history(Some(uid.clone()));
        }
        self.send(OutboundMessage::FetchAndSetHistory { history_uid: uid })
            .await
    }

    /// Starts a fresh history. The log clears now; the backend confirms with
    /// `new-history-created`.
    pub async fn create_history(&self) -> Result<(), SessionError> {
        {
            let mut core = self.core.lock().await;
            core.conversation.clear();
        }
        self.send(OutboundMessage::CreateNewHistory).await
    }

    pub async fn delete_history(&self, uid: impl Into<String>) -> Result<(), SessionError> {
        self.send(OutboundMessage::DeleteHistory {
            history_uid: uid.into(),
        })
        .await
    }

    pub async fn fetch_configs(&self) -> Result<(), SessionError> {
        self.send(OutboundMessage::FetchConfigs).await
    }

    pub async fn switch_config(&self, file: impl Into<String>) -> Result<(), SessionError> {
        self.send(OutboundMessage::SwitchConfig { file: file.into() })
            .await
    }

    /// Sends an arbitrary frame and waits for the backend's correlated
    /// response. A `requestId` is injected into `payload`, which must be a
    /// JSON object.
    pub async fn request(
        &self,
        mut payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, SessionError> {
        let Some(object) = payload.as_object_mut() else {
            return Err(SessionError::Message(
                "request payload must be a JSON object".to_string(),
            ));
        };
        let request_id = uuid::Uuid::new_v4().to_string();
        object.insert(
            "requestId".to_string(),
            serde_json::Value::String(request_id.clone()),
        );

        let receiver = self.pending.register(request_id.clone());
        let frame = serde_json::to_string(&payload)?;
        if let Err(e) = self.transport.send_text(frame).await {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SessionError::Cancelled),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(SessionError::Timeout(timeout))
            }
        }
    }

    /// A fresh receiver for the engine's event stream.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Registers a raw per-kind frame subscriber on the router.
    pub async fn subscribe<F>(&self, kind: MessageKind, handler: F) -> SubscriberId
    where
        F: Fn(&InboundMessage) -> anyhow::Result<()> + Send + 'static,
    {
        self.core.lock().await.router.on(kind, handler)
    }

    pub async fn unsubscribe(&self, kind: MessageKind, id: SubscriberId) {
        self.core.lock().await.router.off(kind, id);
    }

    pub fn connection(&self) -> ConnectionSnapshot {
        self.transport.snapshot()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.core.lock().await.conversation.messages().to_vec()
    }

    pub async fn history_list(&self) -> Vec<HistorySummary> {
        self.core.lock().await.conversation.history_list().to_vec()
    }

    pub async fn current_history(&self) -> Option<String> {
        self.core
            .lock()
            .await
            .conversation
            .current_history()
            .map(str::to_string)
    }

    pub async fn ai_status(&self) -> AiStatus {
        self.core.lock().await.ai_status.clone()
    }

    pub async fn client_uid(&self) -> Option<String> {
        self.core.lock().await.client_uid.clone()
    }

    pub async fn character(&self) -> Option<CharacterConfig> {
        self.core.lock().await.character.clone()
    }

    pub async fn config_files(&self) -> Vec<serde_json::Value> {
        self.core.lock().await.config_files.clone()
    }

    /// The most recent non-connection failure, falling back to the
    /// transport's own record.
    pub async fn last_error(&self) -> Option<LastError> {
        let core = self.core.lock().await.last_error.clone();
        core.or_else(|| self.transport.snapshot().last_error)
    }

    /// Resolves once the playback queue has fully drained.
    pub async fn wait_for_playback_idle(&self) {
        self.sequencer.wait_for_idle().await;
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), SessionError> {
        self.transport.send_text(message.to_wire()?).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// The frame pump: owns the transport's event stream for the lifetime of the
/// session.
struct Pump {
    transport: Transport,
    core: Arc<Mutex<Core>>,
    pending: PendingRequests,
    sequencer: Arc<AudioSequencer>,
    events: broadcast::Sender<SessionEvent>,
    avatar: Option<Arc<dyn AvatarEngine>>,
}

impl Pump {
    async fn run(self, mut transport_events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = transport_events.recv().await {
            match event {
                TransportEvent::Connected => {
                    self.core.lock().await.bootstrapped = false;
                    let _ = self.events.send(SessionEvent::Connected);
                }
                TransportEvent::Disconnected { reason } => {
                    self.pending.fail_all();
                    let _ = self.events.send(SessionEvent::Disconnected { reason });
                }
                TransportEvent::ReconnectScheduled { attempt, delay } => {
                    let _ = self
                        .events
                        .send(SessionEvent::ReconnectScheduled { attempt, delay });
                }
                TransportEvent::RetriesExhausted => {
                    let _ = self.events.send(SessionEvent::RetriesExhausted);
                }
                TransportEvent::TextFrame(raw) => self.handle_frame(&raw).await,
                TransportEvent::BinaryFrame(bytes) => {
                    let _ = self.events.send(SessionEvent::RawAudio(bytes));
                }
            }
        }
        debug!("transport event stream ended, pump exiting");
    }

    async fn handle_frame(&self, raw: &str) {
        let mut outbound = Vec::new();
        {
            let mut guard = self.core.lock().await;
            let core = &mut *guard;
            let Some(message) = core.router.dispatch(raw) else {
                return;
            };
            self.apply(core, message, &mut outbound);
        }
        for message in outbound {
            if let Err(e) = self.send(message).await {
                warn!(error = %e, "follow-up frame failed");
            }
        }
    }

    /// Applies one decoded frame to the core state. Frames that demand a
    /// reply push it onto `outbound`, sent after the lock is released.
    fn apply(&self, core: &mut Core, message: InboundMessage, outbound: &mut Vec<OutboundMessage>) {
        match message {
            InboundMessage::FullText { text } => {
                let id = core.aggregator.on_full_text(&mut core.conversation, &text);
                let _ = self.events.send(SessionEvent::MessageFinalized { id });
            }
            InboundMessage::Audio {
                audio,
                display_text,
                actions,
            } => {
                let outcome = core.aggregator.on_audio(
                    &mut core.conversation,
                    audio.as_deref(),
                    display_text.as_ref(),
                );
                if outcome.changed {
                    let _ = self.events.send(SessionEvent::MessageUpdated {
                        id: outcome.message_id,
                    });
                }
                if let Some(task) = outcome.task {
                    self.sequencer.enqueue(task);
                }
                if let Some(actions) = actions {
                    for index in actions.expressions {
                        if let Some(avatar) = &self.avatar {
                            avatar.set_expression(index);
                        }
                        let _ = self.events.send(SessionEvent::Expression(index));
                    }
                }
            }
            InboundMessage::Control { text: signal } => self.apply_control(core, signal),
            InboundMessage::ForceNewMessage => {
                if let Some(id) = core
                    .aggregator
                    .finalize(&mut core.conversation, MessageStatus::Saved)
                {
                    let _ = self.events.send(SessionEvent::MessageFinalized { id });
                }
            }
            InboundMessage::HistoryList { histories } => {
                core.conversation.set_history_list(histories);
                let _ = self.events.send(SessionEvent::HistoryListUpdated);
            }
            InboundMessage::HistoryData { messages } => {
                core.conversation.load_history(&messages);
                let uid = core
                    .conversation
                    .current_history()
                    .unwrap_or_default()
                    .to_string();
                let _ = self.events.send(SessionEvent::HistoryChanged { uid });
            }
            InboundMessage::NewHistoryCreated { history_uid } => {
                info!(uid = %history_uid, "history created");
                core.conversation.created_history(history_uid.clone());
                let _ = self.events.send(SessionEvent::HistoryChanged {
                    uid: history_uid.clone(),
                });
                outbound.push(OutboundMessage::FetchAndSetHistory { history_uid });
            }
            InboundMessage::HistoryDeleted {
                success,
                history_uid,
            } => {
                if success {
                    core.conversation.deleted_history(&history_uid);
                    let _ = self.events.send(SessionEvent::HistoryListUpdated);
                } else {
                    warn!(uid = %history_uid, "backend refused history deletion");
                }
            }
            InboundMessage::SetModelAndConf {
                client_uid,
                conf_name,
                conf_uid,
                model_info,
            } => {
                if let Some(uid) = client_uid {
                    core.client_uid = Some(uid);
                }
                if let Some(conf_name) = conf_name {
                    core.character = Some(CharacterConfig {
                        conf_name,
                        conf_uid,
                        model_info,
                    });
                }
                let _ = self.events.send(SessionEvent::ConfigUpdated);
                if !core.bootstrapped {
                    core.bootstrapped = true;
                    outbound.push(OutboundMessage::FetchHistoryList);
                }
            }
            InboundMessage::Error { message } => {
                core.last_error = Some(LastError::new(ErrorKind::Message, &message));
                let _ = self.events.send(SessionEvent::BackendError { message });
            }
            InboundMessage::AiStatus { status } => {
                core.ai_status = status.clone();
                let _ = self.events.send(SessionEvent::AiStatusChanged(status));
            }
            InboundMessage::ConfigFiles { configs } => {
                core.config_files = configs;
                let _ = self.events.send(SessionEvent::ConfigUpdated);
            }
            InboundMessage::BackendSynthComplete => {
                // Confirm once local playback actually drains, off the pump.
                let sequencer = self.sequencer.clone();
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    sequencer.wait_for_idle().await;
                    match OutboundMessage::FrontendPlaybackComplete.to_wire() {
                        Ok(frame) => {
                            if let Err(e) = transport.send_text(frame).await {
                                warn!(error = %e, "playback confirmation failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "playback confirmation failed"),
                    }
                });
            }
            InboundMessage::UserInputTranscription { text }
            | InboundMessage::AsrResult { text } => {
                let id = core.conversation.add(
                    MessageDraft::user(text.clone()).with_status(MessageStatus::Sent),
                );
                let _ = self
                    .events
                    .send(SessionEvent::UserTranscription { id, text });
            }
        }
    }

    fn apply_control(&self, core: &mut Core, signal: ControlSignal) {
        match signal {
            ControlSignal::StartMic => {
                core.ai_status = AiStatus::Listening;
                let _ = self.events.send(SessionEvent::MicStart);
                let _ = self
                    .events
                    .send(SessionEvent::AiStatusChanged(AiStatus::Listening));
            }
            ControlSignal::MicAudioEnd => {
                core.ai_status = AiStatus::Waiting;
                let _ = self.events.send(SessionEvent::MicStop);
                let _ = self
                    .events
                    .send(SessionEvent::AiStatusChanged(AiStatus::Waiting));
            }
            ControlSignal::Interrupt => {
                self.sequencer.clear();
                let closed = core
                    .aggregator
                    .finalize(&mut core.conversation, MessageStatus::Received);
                core.ai_status = AiStatus::Interrupted;
                if let Some(id) = closed {
                    let _ = self.events.send(SessionEvent::MessageFinalized { id });
                }
                let _ = self
                    .events
                    .send(SessionEvent::AiStatusChanged(AiStatus::Interrupted));
            }
            ControlSignal::ConversationChainStart => {
                core.conversation.open_or_begin_turn();
                core.ai_status = AiStatus::ThinkingSpeaking;
                let _ = self
                    .events
                    .send(SessionEvent::AiStatusChanged(AiStatus::ThinkingSpeaking));
            }
            ControlSignal::ConversationChainEnd => {
                if let Some(id) = core
                    .aggregator
                    .finalize(&mut core.conversation, MessageStatus::Saved)
                {
                    let _ = self.events.send(SessionEvent::MessageFinalized { id });
                }
                core.ai_status = AiStatus::Idle;
                let _ = self
                    .events
                    .send(SessionEvent::AiStatusChanged(AiStatus::Idle));
            }
            ControlSignal::Other(signal) => {
                debug!(%signal, "unhandled control signal");
            }
        }
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), SessionError> {
        self.transport.send_text(message.to_wire()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::playback::{AudioPlayer, AudioTask};
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct CountingPlayer {
        played: StdMutex<Vec<AudioTask>>,
    }

    impl CountingPlayer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                played: StdMutex::new(Vec::new()),
            })
        }

        fn played(&self) -> Vec<AudioTask> {
            self.played.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AudioPlayer for CountingPlayer {
        async fn play(&self, task: &AudioTask) -> anyhow::Result<()> {
            self.played.lock().unwrap().push(task.clone());
            Ok(())
        }
    }

    /// One-connection scripted backend: everything pushed to the returned
    /// sender goes to the client; every client frame comes out the receiver.
    async fn scripted_server() -> (
        u16,
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            loop {
                tokio::select! {
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if ws.send(WsMessage::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    frame = ws.next() => {
                        match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                let _ = in_tx.send(text);
                            }
                            Some(Ok(_)) => {}
                            _ => break,
                        }
                    }
                }
            }
        });

        (port, out_tx, in_rx)
    }

    fn config_for(port: u16) -> SessionConfig {
        SessionConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port,
                protocol: "ws".to_string(),
                path: "/".to_string(),
            },
            audio_task_gap: Duration::from_millis(1),
            ..SessionConfig::default()
        }
    }

    async fn next_frame(frames: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
        let raw = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client frame stream ended");
        serde_json::from_str(&raw).unwrap()
    }

    async fn wait_for_event<F>(
        events: &mut broadcast::Receiver<SessionEvent>,
        mut matches: F,
    ) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for session event")
                .expect("event stream ended");
            if matches(&event) {
                return event;
            }
        }
    }

    /// Consumes the two bootstrap fetches connect() sends.
    async fn drain_bootstrap(frames: &mut mpsc::UnboundedReceiver<String>) {
        let first = next_frame(frames).await;
        assert_eq!(first["type"], "fetch-history-list");
        let second = next_frame(frames).await;
        assert_eq!(second["type"], "fetch-configs");
    }

    #[tokio::test]
    async fn streamed_turn_becomes_one_saved_message() {
        let (port, to_client, mut from_client) = scripted_server().await;
        let player = CountingPlayer::new();
        let session = Session::spawn(
            config_for(port),
            Collaborators::new(player.clone()),
        );
        let mut events = session.events();

        session.connect().await.unwrap();
        drain_bootstrap(&mut from_client).await;

        to_client
            .send(
                json!({"type":"audio","display_text":{"text":"Hello","segment_order":0}})
                    .to_string(),
            )
            .unwrap();
        to_client
            .send(
                json!({"type":"audio","audio":"QUJD","display_text":{"text":" world","segment_order":1}})
                    .to_string(),
            )
            .unwrap();
        to_client
            .send(json!({"type":"control","text":"conversation-chain-end"}).to_string())
            .unwrap();

        wait_for_event(&mut events, |e| {
            matches!(e, SessionEvent::MessageFinalized { .. })
        })
        .await;

        let messages = session.messages().await;
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.content, "Hello world");
        assert_eq!(message.audio.as_deref(), Some("QUJD"));
        assert!(!message.is_streaming);
        assert_eq!(message.status, MessageStatus::Saved);
        assert_eq!(session.ai_status().await, AiStatus::Idle);

        session.wait_for_playback_idle().await;
        let played = player.played();
        assert_eq!(played.len(), 1);
        assert_eq!(played[0].payload, "QUJD");
    }

    #[tokio::test]
    async fn large_capture_is_chunked_at_the_configured_size() {
        let (port, _to_client, mut from_client) = scripted_server().await;
        let session = Session::spawn(
            config_for(port),
            Collaborators::new(CountingPlayer::new()),
        );
        session.connect().await.unwrap();
        drain_bootstrap(&mut from_client).await;

        session
            .send_audio_chunk(SampleBuffer::F32(vec![0.0; 10000]))
            .await
            .unwrap();
        session.send_audio_end().await.unwrap();

        for expected in [4096, 4096, 1808] {
            let frame = next_frame(&mut from_client).await;
            assert_eq!(frame["type"], "mic-audio-data");
            assert_eq!(frame["audio"].as_array().unwrap().len(), expected);
        }
        let frame = next_frame(&mut from_client).await;
        assert_eq!(frame["type"], "mic-audio-end");
    }

    #[tokio::test]
    async fn send_text_tracks_delivery_status() {
        let (port, _to_client, mut from_client) = scripted_server().await;
        let session = Session::spawn(
            config_for(port),
            Collaborators::new(CountingPlayer::new()),
        );
        session.connect().await.unwrap();
        drain_bootstrap(&mut from_client).await;

        let id = session.send_text("hi there").await.unwrap();
        let frame = next_frame(&mut from_client).await;
        assert_eq!(frame["type"], "text-input");
        assert_eq!(frame["text"], "hi there");

        let messages = session.messages().await;
        let message = messages.iter().find(|m| m.id == id).unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.sender, crate::conversation::Sender::User);
    }

    #[tokio::test]
    async fn request_round_trips_through_the_backend() {
        let (port, to_client, mut from_client) = scripted_server().await;
        let session = Session::spawn(
            config_for(port),
            Collaborators::new(CountingPlayer::new()),
        );
        session.connect().await.unwrap();
        drain_bootstrap(&mut from_client).await;

        let responder = tokio::spawn(async move {
            let frame = next_frame(&mut from_client).await;
            assert_eq!(frame["type"], "lookup");
            let request_id = frame["requestId"].as_str().unwrap();
            to_client
                .send(
                    json!({"type":"full-text","text":"found","requestId":request_id})
                        .to_string(),
                )
                .unwrap();
        });

        let response = session
            .request(json!({"type": "lookup"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response["text"], "found");
        responder.await.unwrap();

        // The correlated response never reached the conversation log.
        assert!(session.messages().await.is_empty());
    }

    #[tokio::test]
    async fn request_times_out_without_a_response() {
        let (port, _to_client, mut from_client) = scripted_server().await;
        let session = Session::spawn(
            config_for(port),
            Collaborators::new(CountingPlayer::new()),
        );
        session.connect().await.unwrap();
        drain_bootstrap(&mut from_client).await;

        let err = session
            .request(json!({"type": "lookup"}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
    }

    #[tokio::test]
    async fn synth_complete_is_confirmed_after_playback() {
        let (port, to_client, mut from_client) = scripted_server().await;
        let session = Session::spawn(
            config_for(port),
            Collaborators::new(CountingPlayer::new()),
        );
        session.connect().await.unwrap();
        drain_bootstrap(&mut from_client).await;

        to_client
            .send(json!({"type":"backend-synth-complete"}).to_string())
            .unwrap();

        let frame = next_frame(&mut from_client).await;
        assert_eq!(frame["type"], "frontend-playback-complete");
    }

    #[tokio::test]
    async fn bootstrap_fetches_history_once_per_connection() {
        let (port, to_client, mut from_client) = scripted_server().await;
        let session = Session::spawn(
            config_for(port),
            Collaborators::new(CountingPlayer::new()),
        );
        session.connect().await.unwrap();
        drain_bootstrap(&mut from_client).await;

        let conf = json!({
            "type": "set-model-and-conf",
            "client_uid": "c-1",
            "conf_name": "Miko",
            "conf_uid": "u-1"
        });
        to_client.send(conf.to_string()).unwrap();
        let frame = next_frame(&mut from_client).await;
        assert_eq!(frame["type"], "fetch-history-list");

        assert_eq!(session.client_uid().await.as_deref(), Some("c-1"));
        assert_eq!(
            session.character().await.map(|c| c.conf_name),
            Some("Miko".to_string())
        );

        // A repeated announcement must not refetch.
        to_client.send(conf.to_string()).unwrap();
        let quiet =
            tokio::time::timeout(Duration::from_millis(200), from_client.recv()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn transcription_appends_a_user_message() {
        let (port, to_client, mut from_client) = scripted_server().await;
        let session = Session::spawn(
            config_for(port),
            Collaborators::new(CountingPlayer::new()),
        );
        let mut events = session.events();
        session.connect().await.unwrap();
        drain_bootstrap(&mut from_client).await;

        to_client
            .send(json!({"type":"asr_result","text":"spoken words"}).to_string())
            .unwrap();
        let event = wait_for_event(&mut events, |e| {
            matches!(e, SessionEvent::UserTranscription { .. })
        })
        .await;
        let SessionEvent::UserTranscription { id, text } = event else {
            unreachable!()
        };
        assert_eq!(text, "spoken words");

        let messages = session.messages().await;
        let message = messages.iter().find(|m| m.id == id).unwrap();
        assert_eq!(message.sender, crate::conversation::Sender::User);
        assert_eq!(message.content, "spoken words");
    }

    #[tokio::test]
    async fn history_flow_loads_and_switches() {
        let (port, to_client, mut from_client) = scripted_server().await;
        let session = Session::spawn(
            config_for(port),
            Collaborators::new(CountingPlayer::new()),
        );
        let mut events = session.events();
        session.connect().await.unwrap();
        drain_bootstrap(&mut from_client).await;

        to_client
            .send(
                json!({"type":"history-list","histories":[{"uid":"h-1"},{"uid":"h-2"}]})
                    .to_string(),
            )
            .unwrap();
        wait_for_event(&mut events, |e| {
            matches!(e, SessionEvent::HistoryListUpdated)
        })
        .await;
        assert_eq!(session.history_list().await.len(), 2);

        session.load_history("h-2").await.unwrap();
        let frame = next_frame(&mut from_client).await;
        assert_eq!(frame["type"], "fetch-and-set-history");
        assert_eq!(frame["history_uid"], "h-2");

        to_client
            .send(
                json!({"type":"history-data","messages":[
                    {"role":"human","content":"hi","message_id":"m-1"},
                    {"role":"ai","content":"hello!","message_id":"m-2"}
                ]})
                .to_string(),
            )
            .unwrap();
        wait_for_event(&mut events, |e| {
            matches!(e, SessionEvent::HistoryChanged { uid } if uid == "h-2")
        })
        .await;

        let messages = session.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].content, "hello!");
        assert_eq!(session.current_history().await.as_deref(), Some("h-2"));
    }

    #[tokio::test]
    async fn interrupt_clears_playback_and_closes_the_turn() {
        let (port, to_client, mut from_client) = scripted_server().await;
        let player = CountingPlayer::new();
        let session = Session::spawn(
            config_for(port),
            Collaborators::new(player.clone()),
        );
        let mut events = session.events();
        session.connect().await.unwrap();
        drain_bootstrap(&mut from_client).await;

        to_client
            .send(
                json!({"type":"audio","display_text":{"text":"I was saying","segment_order":0}})
                    .to_string(),
            )
            .unwrap();
        wait_for_event(&mut events, |e| {
            matches!(e, SessionEvent::MessageUpdated { .. })
        })
        .await;

        session.send_interrupt(None).await.unwrap();
        let frame = next_frame(&mut from_client).await;
        assert_eq!(frame["type"], "interrupt-signal");

        assert_eq!(session.ai_status().await, AiStatus::Interrupted);
        let messages = session.messages().await;
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].is_streaming);
    }

    #[tokio::test]
    async fn backend_error_is_recorded_and_broadcast() {
        let (port, to_client, mut from_client) = scripted_server().await;
        let session = Session::spawn(
            config_for(port),
            Collaborators::new(CountingPlayer::new()),
        );
        let mut events = session.events();
        session.connect().await.unwrap();
        drain_bootstrap(&mut from_client).await;

        to_client
            .send(json!({"type":"error","message":"no such history"}).to_string())
            .unwrap();
        let event = wait_for_event(&mut events, |e| {
            matches!(e, SessionEvent::BackendError { .. })
        })
        .await;
        let SessionEvent::BackendError { message } = event else {
            unreachable!()
        };
        assert_eq!(message, "no such history");

        let last = session.last_error().await.unwrap();
        assert_eq!(last.kind, ErrorKind::Message);
        assert_eq!(last.message, "no such history");
    }
}
