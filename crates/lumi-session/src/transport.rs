//! WebSocket transport with automatic reconnection.
//!
//! A single actor task owns the socket; callers talk to it through a cloned
//! [`Transport`] handle. Inbound frames and connection-state changes are
//! published on one event stream so the consumer observes them in arrival
//! order. An involuntary disconnect schedules reconnect attempts with
//! exponential backoff; an explicit disconnect never does.

use crate::config::SessionConfig;
use crate::error::{LastError, SessionError};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, instrument, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Why a live connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The caller asked for it.
    Local,
    /// The server closed the socket.
    Remote,
    /// The socket failed.
    Error(String),
}

/// Point-in-time view of the connection, readable without touching the actor.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub retry_count: u32,
    pub last_error: Option<LastError>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            retry_count: 0,
            last_error: None,
            connected_at: None,
        }
    }
}

/// Everything the transport reports upward, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    TextFrame(String),
    BinaryFrame(Vec<u8>),
    ReconnectScheduled { attempt: u32, delay: Duration },
    RetriesExhausted,
}

enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SendText {
        frame: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SendBinary {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Cloneable handle to the transport actor.
#[derive(Clone)]
pub struct Transport {
    commands: mpsc::Sender<Command>,
    shared: Arc<Mutex<ConnectionSnapshot>>,
}

impl Transport {
    /// Spawns the actor and returns the handle plus the event stream. The
    /// actor stays idle until the first [`connect`](Self::connect).
    pub fn new(config: &SessionConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(ConnectionSnapshot::default()));

        let actor = TransportActor {
            url: config.server.url(),
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            connect_timeout: config.connect_timeout,
            commands: command_rx,
            events: event_tx,
            shared: shared.clone(),
            queue: VecDeque::new(),
            retry_count: 0,
            auto_reconnect: false,
            retry_at: None,
        };
        tokio::spawn(actor.run());

        (
            Self {
                commands: command_tx,
                shared,
            },
            event_rx,
        )
    }

    /// Opens the connection and arms auto-reconnect. Fails when a connection
    /// is already active or the first attempt does not open; reconnection
    /// keeps running in the background either way.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Closes the connection and disarms auto-reconnect. Idempotent.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Sends one text frame. While disconnected the frame is queued for the
    /// next successful connect and `NotConnected` is returned.
    pub async fn send_text(&self, frame: String) -> Result<(), SessionError> {
        self.request(|reply| Command::SendText { frame, reply })
            .await?
    }

    /// Sends one binary frame. Binary frames are never queued.
    pub async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), SessionError> {
        self.request(|reply| Command::SendBinary { bytes, reply })
            .await?
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.snapshot().status
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }
}

struct TransportActor {
    url: String,
    max_retries: u32,
    base_delay: Duration,
    connect_timeout: Duration,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shared: Arc<Mutex<ConnectionSnapshot>>,
    /// Text frames accepted while disconnected, flushed on the next connect.
    queue: VecDeque<String>,
    retry_count: u32,
    auto_reconnect: bool,
    retry_at: Option<Instant>,
}

impl TransportActor {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn run(mut self) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else { return };
                    match cmd {
                        Command::Connect { reply } => {
                            self.auto_reconnect = true;
                            self.retry_at = None;
                            self.set_retry_count(0);
                            self.session(Some(reply)).await;
                        }
                        Command::Disconnect { reply } => {
                            // Cancels a pending reconnect, nothing else to do.
                            self.auto_reconnect = false;
                            self.retry_at = None;
                            self.set_retry_count(0);
                            let _ = reply.send(());
                        }
                        Command::SendText { frame, reply } => {
                            debug!("queueing frame while disconnected");
                            self.queue.push_back(frame);
                            let _ = reply.send(Err(SessionError::NotConnected));
                        }
                        Command::SendBinary { reply, .. } => {
                            let _ = reply.send(Err(SessionError::NotConnected));
                        }
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)),
                        if retry_at.is_some() => {
                    self.retry_at = None;
                    self.session(None).await;
                }
            }
        }
    }

    /// One connection lifetime: open the socket, pump it until it ends, then
    /// decide whether to schedule a retry.
    async fn session(&mut self, reply: Option<oneshot::Sender<Result<(), SessionError>>>) {
        self.set_status(ConnectionStatus::Connecting);
        let ws = match self.establish().await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "connection attempt failed");
                self.record_error(&e);
                self.set_status(ConnectionStatus::Disconnected);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                if self.auto_reconnect {
                    self.schedule_reconnect();
                }
                return;
            }
        };

        info!("connected");
        self.set_retry_count(0);
        {
            let mut snapshot = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            snapshot.status = ConnectionStatus::Connected;
            snapshot.connected_at = Some(Utc::now());
        }
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
        let _ = self.events.send(TransportEvent::Connected);

        let reason = self.pump(ws).await;

        {
            let mut snapshot = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            snapshot.status = ConnectionStatus::Disconnected;
            snapshot.connected_at = None;
        }
        if let DisconnectReason::Error(msg) = &reason {
            self.record_error(&SessionError::Connection(msg.clone()));
        }
        info!(?reason, "disconnected");
        let _ = self.events.send(TransportEvent::Disconnected {
            reason: reason.clone(),
        });

        if reason != DisconnectReason::Local && self.auto_reconnect {
            self.schedule_reconnect();
        }
    }

    async fn establish(&self) -> Result<WsStream, SessionError> {
        debug!("opening websocket");
        match tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(SessionError::Connection(e.to_string())),
            Err(_) => Err(SessionError::Timeout(self.connect_timeout)),
        }
    }

    /// Pumps the live socket until it ends, serving send commands meanwhile.
    async fn pump(&mut self, mut ws: WsStream) -> DisconnectReason {
        while let Some(frame) = self.queue.pop_front() {
            debug!("flushing queued frame");
            if let Err(e) = ws.send(WsMessage::Text(frame)).await {
                return DisconnectReason::Error(e.to_string());
            }
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = ws.close(None).await;
                        return DisconnectReason::Local;
                    };
                    match cmd {
                        Command::Connect { reply } => {
                            let _ = reply.send(Err(SessionError::AlreadyActive));
                        }
                        Command::Disconnect { reply } => {
                            self.auto_reconnect = false;
                            let _ = ws.close(None).await;
                            let _ = reply.send(());
                            return DisconnectReason::Local;
                        }
                        Command::SendText { frame, reply } => {
                            match ws.send(WsMessage::Text(frame)).await {
                                Ok(()) => {
                                    let _ = reply.send(Ok(()));
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(SessionError::Connection(
                                        e.to_string(),
                                    )));
                                    return DisconnectReason::Error(e.to_string());
                                }
                            }
                        }
                        Command::SendBinary { bytes, reply } => {
                            match ws.send(WsMessage::Binary(bytes)).await {
                                Ok(()) => {
                                    let _ = reply.send(Ok(()));
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(SessionError::Connection(
                                        e.to_string(),
                                    )));
                                    return DisconnectReason::Error(e.to_string());
                                }
                            }
                        }
                    }
                }
                frame = ws.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let _ = self.events.send(TransportEvent::TextFrame(text));
                        }
                        Some(Ok(WsMessage::Binary(bytes))) => {
                            let _ = self.events.send(TransportEvent::BinaryFrame(bytes));
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return DisconnectReason::Remote;
                        }
                        Some(Ok(_)) => {} // ping/pong handled by the library
                        Some(Err(e)) => {
                            return DisconnectReason::Error(e.to_string());
                        }
                    }
                }
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.retry_count >= self.max_retries {
            warn!(
                attempts = self.retry_count,
                "reconnect attempts exhausted"
            );
            let _ = self.events.send(TransportEvent::RetriesExhausted);
            self.auto_reconnect = false;
            return;
        }
        let delay = self.base_delay * 2u32.saturating_pow(self.retry_count);
        self.set_retry_count(self.retry_count + 1);
        info!(attempt = self.retry_count, ?delay, "reconnect scheduled");
        let _ = self.events.send(TransportEvent::ReconnectScheduled {
            attempt: self.retry_count,
            delay,
        });
        self.retry_at = Some(Instant::now() + delay);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .status = status;
    }

    fn set_retry_count(&mut self, count: u32) {
        self.retry_count = count;
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retry_count = count;
    }

    fn record_error(&self, err: &SessionError) {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_error = Some(LastError::of(err));
    }
}
