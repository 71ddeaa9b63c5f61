//! WebSocket client link to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect, shutdown)
//! - Whole-document edit send with an outbound queue while not open
//! - Inbound update and conflict application to the editor surface
//! - Status, roster and notice events for the application
//!
//! One driver task owns the state machine, the queue and the surface:
//!
//! ```text
//!            ┌──────────────────────── retry delay ───────────────┐
//!            ▼                                                    │
//! start ─► Connecting ──ok──► Open ──close/error──► Reconnecting ─┘
//!            │  └────failure────────────────────────────▲
//!            └─ shutdown (any state) ─► Disconnected
//! ```
//!
//! [`ClientLink`] is the handle; it talks to the driver over a command
//! channel, so a superseded connection attempt or retry timer is cancelled
//! simply by the driver dropping that future.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::LinkError;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, Timestamp};
use crate::registry::ConnectionId;
use crate::surface::{resolve_user, EditorSurface, IdentityProvider};

/// Shown after an edit is written to an open link.
pub const SENT_NOTICE: &str = "Edits sent successfully!";

/// Shown after an edit is queued behind a connection attempt.
pub const QUEUED_NOTICE: &str = "Link is connecting. Your edit will be sent when ready.";

/// Default upper bound on queued edits.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Shut down; no attempt in flight.
    Disconnected,
    Connecting,
    Open,
    /// Lost or failed; waiting out the retry delay.
    Reconnecting,
}

/// Delay between a lost link and the next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed(Duration),
    /// Doubles per consecutive failure, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let factor = 1u32
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed(Duration::from_secs(1))
    }
}

/// Client link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Server WebSocket URL
    pub server_url: String,
    pub reconnect: ReconnectPolicy,
    /// Maximum number of queued edits
    pub outbound_capacity: usize,
    /// Buffered events before new ones are dropped
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3000".to_string(),
            reconnect: ReconnectPolicy::default(),
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A message meant for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }
}

/// Events emitted by the client link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The link changed state
    Status(LinkState),
    /// A connection attempt or an open link failed
    TransportError(String),
    /// The server sent its document on connect
    InitialState {
        content: String,
        last_updated: Timestamp,
    },
    /// A remote edit replaced the surface
    DocumentReplaced { content: String },
    /// Our edit was rejected and the surface reset to the server's content
    Conflict {
        details: String,
        current_content: String,
    },
    /// Current participant list
    Roster(Vec<ConnectionId>),
    Notice(Notice),
}

/// Result of a successful [`ClientLink::send_edit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open link
    Sent,
    /// Queued until the link opens
    Queued,
}

/// Serialized edits waiting for the link to open.
///
/// Drained front to back on open. An entry is only removed once it has
/// been written, so a link that drops mid-drain keeps the rest.
#[derive(Debug)]
pub struct OutboundQueue {
    queue: VecDeque<String>,
    max_size: usize,
}

impl OutboundQueue {
    /// Create a new queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Append a frame. Returns false if the queue is full.
    pub fn enqueue(&mut self, frame: String) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    /// Oldest queued frame.
    pub fn front(&self) -> Option<&str> {
        self.queue.front().map(String::as_str)
    }

    pub fn pop_front(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(String::len).sum()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

/// Commands from [`ClientLink`] to its driver.
#[derive(Debug)]
enum LinkCommand {
    SendEdit {
        reply: oneshot::Sender<Result<SendOutcome, LinkError>>,
    },
    QueueLen {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running client link.
///
/// Dropping the handle shuts the link down.
pub struct ClientLink {
    server_url: String,
    state: Arc<RwLock<LinkState>>,
    roster: Arc<RwLock<Vec<ConnectionId>>>,
    commands: mpsc::Sender<LinkCommand>,
    event_tx: mpsc::Sender<LinkEvent>,
    event_rx: Option<mpsc::Receiver<LinkEvent>>,
    task: JoinHandle<()>,
}

impl ClientLink {
    /// Spawn the driver and begin connecting immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S, I>(config: LinkConfig, surface: S, identity: I) -> Self
    where
        S: EditorSurface + 'static,
        I: IdentityProvider + 'static,
    {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (commands, command_rx) = mpsc::channel(32);
        let state = Arc::new(RwLock::new(LinkState::Connecting));
        let roster = Arc::new(RwLock::new(Vec::new()));
        let server_url = config.server_url.clone();

        let driver = LinkDriver {
            queue: OutboundQueue::new(config.outbound_capacity),
            config,
            surface,
            identity,
            state: state.clone(),
            roster: roster.clone(),
            events: event_tx.clone(),
            commands: command_rx,
            failures: 0,
            shutdown_reply: None,
        };
        let task = tokio::spawn(driver.run());

        Self {
            server_url,
            state,
            roster,
            commands,
            event_tx,
            event_rx: Some(event_rx),
            task,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<LinkEvent>> {
        self.event_rx.take()
    }

    /// Send the whole surface text as an edit.
    ///
    /// Queued while a connection attempt is in flight. Fails with
    /// [`LinkError::Disconnected`] once the link has been shut down.
    /// Every failure is also reported as an error [`Notice`].
    pub async fn send_edit(&self) -> Result<SendOutcome, LinkError> {
        let (reply, rx) = oneshot::channel();
        let result = match self.commands.send(LinkCommand::SendEdit { reply }).await {
            Ok(()) => rx.await.unwrap_or(Err(LinkError::Disconnected)),
            Err(_) => Err(LinkError::Disconnected),
        };
        if let Err(e) = &result {
            let notice = Notice::new(NoticeLevel::Error, e.to_string());
            let _ = self.event_tx.try_send(LinkEvent::Notice(notice));
        }
        result
    }

    /// Stop the driver. Queued edits are discarded.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(LinkCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Get the current link state.
    pub async fn connection_state(&self) -> LinkState {
        *self.state.read().await
    }

    /// Latest participant list received from the server.
    pub async fn roster(&self) -> Vec<ConnectionId> {
        self.roster.read().await.clone()
    }

    /// Number of edits waiting for the link to open.
    pub async fn queued_len(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(LinkCommand::QueueLen { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Whether the driver task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

enum Attempt {
    Connected(Box<WsStream>),
    Failed(String),
    Shutdown,
}

struct LinkDriver<S, I> {
    config: LinkConfig,
    surface: S,
    identity: I,
    queue: OutboundQueue,
    state: Arc<RwLock<LinkState>>,
    roster: Arc<RwLock<Vec<ConnectionId>>>,
    events: mpsc::Sender<LinkEvent>,
    commands: mpsc::Receiver<LinkCommand>,
    /// Consecutive failed or lost connections since the last open.
    failures: u32,
    shutdown_reply: Option<oneshot::Sender<()>>,
}

impl<S: EditorSurface, I: IdentityProvider> LinkDriver<S, I> {
    async fn run(mut self) {
        loop {
            self.set_state(LinkState::Connecting).await;
            let ws = match self.establish().await {
                Attempt::Connected(ws) => ws,
                Attempt::Failed(e) => {
                    log::warn!("Connection to {} failed: {e}", self.config.server_url);
                    self.emit(LinkEvent::TransportError(e));
                    if self.retry_after_delay().await == Flow::Shutdown {
                        break;
                    }
                    continue;
                }
                Attempt::Shutdown => break,
            };

            self.failures = 0;
            self.set_state(LinkState::Open).await;
            log::info!("Connected to {}", self.config.server_url);

            if self.session(*ws).await == Flow::Shutdown {
                break;
            }
            if self.retry_after_delay().await == Flow::Shutdown {
                break;
            }
        }
        self.finish().await;
    }

    /// Race the handshake against incoming commands.
    async fn establish(&mut self) -> Attempt {
        let connect = tokio_tungstenite::connect_async(self.config.server_url.clone());
        tokio::pin!(connect);
        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok((ws, _)) => Attempt::Connected(Box::new(ws)),
                        Err(e) => Attempt::Failed(e.to_string()),
                    };
                }
                cmd = self.commands.recv() => {
                    if self.handle_offline(cmd) == Flow::Shutdown {
                        return Attempt::Shutdown;
                    }
                }
            }
        }
    }

    /// Enter `Reconnecting` and wait out the policy delay, still
    /// accepting commands.
    async fn retry_after_delay(&mut self) -> Flow {
        self.failures = self.failures.saturating_add(1);
        self.set_state(LinkState::Reconnecting).await;
        let delay = self.config.reconnect.delay_for(self.failures);
        log::info!("Reconnecting in {delay:?} (attempt {})", self.failures);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Flow::Continue,
                cmd = self.commands.recv() => {
                    if self.handle_offline(cmd) == Flow::Shutdown {
                        return Flow::Shutdown;
                    }
                }
            }
        }
    }

    /// Commands while not open: edits are queued.
    fn handle_offline(&mut self, cmd: Option<LinkCommand>) -> Flow {
        match cmd {
            Some(LinkCommand::SendEdit { reply }) => {
                let result = self.compose_edit().and_then(|frame| self.enqueue(frame));
                let _ = reply.send(result);
                Flow::Continue
            }
            Some(LinkCommand::QueueLen { reply }) => {
                let _ = reply.send(self.queue.len());
                Flow::Continue
            }
            Some(LinkCommand::Shutdown { reply }) => {
                self.shutdown_reply = Some(reply);
                Flow::Shutdown
            }
            None => Flow::Shutdown,
        }
    }

    /// Serve an open link until it closes or the handle asks to stop.
    async fn session(&mut self, ws: WsStream) -> Flow {
        let (mut sink, mut stream) = ws.split();

        let queued = self.queue.len();
        while let Some(frame) = self.queue.front().map(str::to_owned) {
            if let Err(e) = sink.send(Message::text(frame)).await {
                log::warn!("Link lost while flushing queue ({} left): {e}", self.queue.len());
                self.emit(LinkEvent::TransportError(e.to_string()));
                return Flow::Continue;
            }
            self.queue.pop_front();
        }
        if queued > 0 {
            log::info!("Flushed {queued} queued edits");
        }

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.apply_inbound(text.as_str()).await,
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Server closed the link");
                            return Flow::Continue;
                        }
                        Some(Err(e)) => {
                            log::warn!("Link error: {e}");
                            self.emit(LinkEvent::TransportError(e.to_string()));
                            return Flow::Continue;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(LinkCommand::SendEdit { reply }) => {
                            let frame = match self.compose_edit() {
                                Ok(frame) => frame,
                                Err(e) => {
                                    let _ = reply.send(Err(e));
                                    continue;
                                }
                            };
                            match sink.send(Message::text(frame.clone())).await {
                                Ok(()) => {
                                    log::debug!("Sent edit ({} bytes)", frame.len());
                                    self.emit(LinkEvent::Notice(Notice::new(NoticeLevel::Info, SENT_NOTICE)));
                                    let _ = reply.send(Ok(SendOutcome::Sent));
                                }
                                Err(e) => {
                                    // Never reached the server; resend on the next open.
                                    log::warn!("Send failed, queueing edit: {e}");
                                    let _ = reply.send(self.enqueue(frame));
                                    self.emit(LinkEvent::TransportError(e.to_string()));
                                    return Flow::Continue;
                                }
                            }
                        }
                        Some(LinkCommand::QueueLen { reply }) => {
                            let _ = reply.send(self.queue.len());
                        }
                        Some(LinkCommand::Shutdown { reply }) => {
                            self.shutdown_reply = Some(reply);
                            let _ = sink.close().await;
                            return Flow::Shutdown;
                        }
                        None => {
                            let _ = sink.close().await;
                            return Flow::Shutdown;
                        }
                    }
                }
            }
        }
    }

    fn compose_edit(&self) -> Result<String, LinkError> {
        let user_id = resolve_user(&self.identity);
        let msg = ClientMessage::edit(self.surface.text(), Utc::now(), user_id);
        Ok(msg.encode()?)
    }

    fn enqueue(&mut self, frame: String) -> Result<SendOutcome, LinkError> {
        if !self.queue.enqueue(frame) {
            log::warn!("Outbound queue full, rejecting edit");
            return Err(LinkError::QueueFull(self.queue.capacity()));
        }
        log::debug!("Queued edit ({} waiting)", self.queue.len());
        self.emit(LinkEvent::Notice(Notice::new(NoticeLevel::Warning, QUEUED_NOTICE)));
        Ok(SendOutcome::Queued)
    }

    async fn apply_inbound(&mut self, raw: &str) {
        match ServerMessage::decode(raw) {
            Ok(ServerMessage::UpdateDocument { content }) => {
                self.surface.replace_all(&content);
                self.emit(LinkEvent::DocumentReplaced { content });
            }
            Ok(ServerMessage::ConflictDetected {
                details,
                current_content,
            }) => {
                log::info!("Edit rejected by server: {details}");
                self.surface.replace_all(&current_content);
                let notice = Notice::new(NoticeLevel::Error, format!("Conflict detected: {details}"));
                self.emit(LinkEvent::Conflict {
                    details,
                    current_content,
                });
                self.emit(LinkEvent::Notice(notice));
            }
            Ok(ServerMessage::InitialState {
                content,
                last_updated,
            }) => {
                self.emit(LinkEvent::InitialState {
                    content,
                    last_updated,
                });
            }
            Ok(ServerMessage::UserListUpdate { users }) => {
                *self.roster.write().await = users.clone();
                self.emit(LinkEvent::Roster(users));
            }
            Err(ProtocolError::UnknownType(kind)) => {
                log::warn!("Unexpected message type {kind:?}");
            }
            Err(e) => {
                log::error!("Failed to process server message: {e}");
            }
        }
    }

    async fn set_state(&mut self, state: LinkState) {
        *self.state.write().await = state;
        log::debug!("Link state: {state:?}");
        self.emit(LinkEvent::Status(state));
    }

    fn emit(&self, event: LinkEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            log::debug!("Event channel full, dropping {event:?}");
        }
    }

    async fn finish(mut self) {
        if !self.queue.is_empty() {
            log::warn!("Discarding {} queued edits on shutdown", self.queue.len());
            self.queue.clear();
        }
        self.set_state(LinkState::Disconnected).await;
        log::info!("Link to {} shut down", self.config.server_url);
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(());
        }
    }
}
