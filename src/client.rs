//! WebSocket client gateway for one participant.
//!
//! Connection lifecycle is a small state machine:
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──JoinAck──► Connected
//!       ▲                                                │
//!       │   attempts exhausted (cap 5)        unexpected drop
//!       └────────── Reconnecting(attempt) ◄──────────────┘
//! ```
//!
//! Every successful (re)connect re-requests full state via `Join`; no
//! buffered history is assumed to have survived the outage. The UI layer
//! reads `connected` / `reconnect_attempts` / `last_error` from
//! [`ClientStatus`] instead of guessing from event timing.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{
    ChatMessage, ClientFrame, ElementId, FurnitureItem, MutationEvent, ParticipantInfo,
    ProtocolError, ServerFrame, SessionSnapshot,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// UI-observable connection status.
#[derive(Debug, Clone, Default)]
pub struct ClientStatus {
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

/// Events emitted to the application (rendering layer, UI panel).
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Joined (or rejoined) with the session's full state.
    Connected { snapshot: SessionSnapshot },
    Disconnected,
    /// All reconnection attempts exhausted; a manual `connect` is needed.
    ReconnectFailed { attempts: u32 },
    /// The server refused the join and closed the connection.
    JoinRejected { reason: String },
    Mutation {
        sequence: u64,
        origin: Uuid,
        event: MutationEvent,
    },
    Chat(ChatMessage),
    UserJoined(ParticipantInfo),
    UserLeft { user_id: Uuid },
    ElementLocked { element_id: ElementId, user_id: Uuid },
    ElementUnlocked { element_id: ElementId },
    CursorMoved { user_id: Uuid, x: f32, y: f32 },
    SelectionChanged {
        user_id: Uuid,
        element_ids: Vec<ElementId>,
    },
    LockResult {
        element_id: ElementId,
        granted: bool,
        holder: Option<Uuid>,
    },
    /// The server shed the intent under load; retry if it mattered.
    Busy,
}

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`.
    pub url: String,
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    /// Reconnection attempt cap after an unexpected disconnect.
    pub max_reconnect_attempts: u32,
    /// First backoff delay; doubles per attempt up to `max_backoff`.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Minimum interval between outgoing cursor updates (30 fps).
    pub cursor_interval: Duration,
}

impl ClientConfig {
    pub fn new(
        url: impl Into<String>,
        project_id: Uuid,
        user_id: Uuid,
        username: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            project_id,
            user_id,
            username: username.into(),
            max_reconnect_attempts: 5,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            cursor_interval: Duration::from_millis(33),
        }
    }
}

/// Exponential backoff for a 1-based attempt number, capped.
fn backoff_delay(config: &ClientConfig, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    config
        .base_backoff
        .saturating_mul(1u32 << shift)
        .min(config.max_backoff)
}

struct ClientShared {
    config: ClientConfig,
    state: RwLock<ConnectionState>,
    status: RwLock<ClientStatus>,
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    event_tx: mpsc::Sender<ClientEvent>,
    /// Set on explicit disconnect (or terminal rejection): suppresses the
    /// automatic reconnection loop.
    shutdown: AtomicBool,
    last_cursor_sent: Mutex<Option<Instant>>,
}

/// The collaboration client.
pub struct CollabClient {
    shared: Arc<ClientShared>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl CollabClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            shared: Arc::new(ClientShared {
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                status: RwLock::new(ClientStatus::default()),
                outgoing: RwLock::new(None),
                event_tx,
                shutdown: AtomicBool::new(false),
                last_cursor_sent: Mutex::new(None),
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Open the connection and send `Join`. The session snapshot arrives
    /// as `ClientEvent::Connected` once the server acks. Reconnection
    /// after later unexpected drops is automatic; an initial failure is
    /// returned to the caller instead.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.shared.shutdown.store(false, Ordering::SeqCst);
        *self.shared.state.write().await = ConnectionState::Connecting;
        match establish(self.shared.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                self.shared.status.write().await.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Clean exit: sends `Leave`, closes the transport, and disables
    /// automatic reconnection.
    pub async fn disconnect(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let outgoing = self.shared.outgoing.write().await.take();
        if let Some(tx) = outgoing {
            if let Ok(bytes) = ClientFrame::Leave.encode() {
                let _ = tx.send(bytes).await;
            }
            // Dropping the sender ends the writer task and closes the
            // socket.
        }
        *self.shared.state.write().await = ConnectionState::Disconnected;
        let mut status = self.shared.status.write().await;
        status.connected = false;
    }

    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub async fn status(&self) -> ClientStatus {
        self.shared.status.read().await.clone()
    }

    pub fn user_id(&self) -> Uuid {
        self.shared.config.user_id
    }

    pub fn project_id(&self) -> Uuid {
        self.shared.config.project_id
    }

    /// Send a cursor update, throttled to the configured interval.
    /// Fire-and-forget: throttled or offline updates vanish silently —
    /// a newer position always supersedes them.
    pub async fn send_cursor(&self, x: f32, y: f32) -> Result<(), ClientError> {
        {
            let mut last = self
                .shared
                .last_cursor_sent
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(t) = *last {
                if t.elapsed() < self.shared.config.cursor_interval {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }
        match self.send_frame(ClientFrame::CursorUpdate { x, y }).await {
            Ok(()) | Err(ClientError::NotConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn send_selection(&self, element_ids: Vec<ElementId>) -> Result<(), ClientError> {
        self.send_frame(ClientFrame::SelectionUpdate { element_ids })
            .await
    }

    /// Request the advisory lock; the outcome arrives as
    /// `ClientEvent::LockResult`. A denial is a normal reply, not an
    /// error — the caller stays read-only on that element.
    pub async fn send_lock_request(&self, element_id: ElementId) -> Result<(), ClientError> {
        self.send_frame(ClientFrame::LockRequest { element_id })
            .await
    }

    pub async fn send_unlock(&self, element_id: ElementId) -> Result<(), ClientError> {
        self.send_frame(ClientFrame::UnlockRequest { element_id })
            .await
    }

    pub async fn send_furniture_add(&self, item: FurnitureItem) -> Result<(), ClientError> {
        self.send_frame(ClientFrame::FurnitureAdd { item }).await
    }

    pub async fn send_furniture_move(
        &self,
        element_id: ElementId,
        x: f32,
        y: f32,
    ) -> Result<(), ClientError> {
        self.send_frame(ClientFrame::FurnitureMove { element_id, x, y })
            .await
    }

    pub async fn send_furniture_remove(&self, element_id: ElementId) -> Result<(), ClientError> {
        self.send_frame(ClientFrame::FurnitureRemove { element_id })
            .await
    }

    pub async fn send_design_update(&self, patch: String) -> Result<(), ClientError> {
        self.send_frame(ClientFrame::DesignUpdate { patch }).await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.send_frame(ClientFrame::ChatSend { text: text.into() })
            .await
    }

    async fn send_frame(&self, frame: ClientFrame) -> Result<(), ClientError> {
        if *self.shared.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let bytes = frame.encode()?;
        let tx = self
            .shared
            .outgoing
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        tx.send(bytes).await.map_err(|_| ClientError::NotConnected)
    }
}

/// Open the socket, start the writer and reader tasks, and send `Join`.
async fn establish(shared: Arc<ClientShared>) -> Result<(), ClientError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(&shared.config.url)
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    let (mut ws_sender, ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);

    // Writer task: forward the outgoing channel onto the socket.
    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_sender.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let join = ClientFrame::Join {
        project_id: shared.config.project_id,
        user_id: shared.config.user_id,
        username: shared.config.username.clone(),
    }
    .encode()?;
    out_tx
        .send(join)
        .await
        .map_err(|_| ClientError::Connect("socket closed during join".into()))?;

    *shared.outgoing.write().await = Some(out_tx);
    tokio::spawn(read_loop(shared, ws_reader));
    Ok(())
}

async fn read_loop(
    shared: Arc<ClientShared>,
    mut ws_reader: impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
) {
    let mut rejected = false;
    while let Some(msg) = ws_reader.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                match ServerFrame::decode(&bytes) {
                    Ok(frame) => {
                        if !handle_frame(&shared, frame).await {
                            rejected = true;
                            break;
                        }
                    }
                    Err(e) => log::warn!("failed to decode server frame: {e}"),
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    *shared.state.write().await = ConnectionState::Disconnected;
    {
        let mut status = shared.status.write().await;
        status.connected = false;
    }
    *shared.outgoing.write().await = None;
    let _ = shared.event_tx.send(ClientEvent::Disconnected).await;

    if !rejected && !shared.shutdown.load(Ordering::SeqCst) {
        log::info!("connection lost, starting reconnection");
        tokio::spawn(reconnect_loop(shared));
    }
}

/// Apply one server frame; returns `false` on terminal rejection.
async fn handle_frame(shared: &Arc<ClientShared>, frame: ServerFrame) -> bool {
    let event = match frame {
        ServerFrame::JoinAck { snapshot } => {
            *shared.state.write().await = ConnectionState::Connected;
            {
                let mut status = shared.status.write().await;
                status.connected = true;
                status.reconnect_attempts = 0;
                status.last_error = None;
            }
            log::info!("joined session {}", shared.config.project_id);
            ClientEvent::Connected { snapshot }
        }
        ServerFrame::JoinRejected { reason } => {
            log::warn!("join rejected: {reason}");
            shared.status.write().await.last_error = Some(reason.clone());
            // Terminal: the pre-validating system said no; retrying the
            // same join would only be rejected again.
            shared.shutdown.store(true, Ordering::SeqCst);
            let _ = shared
                .event_tx
                .send(ClientEvent::JoinRejected { reason })
                .await;
            return false;
        }
        ServerFrame::LockResult {
            element_id,
            granted,
            holder,
        } => ClientEvent::LockResult {
            element_id,
            granted,
            holder,
        },
        ServerFrame::MutationBroadcast {
            sequence,
            origin,
            event,
        } => ClientEvent::Mutation {
            sequence,
            origin,
            event,
        },
        ServerFrame::ChatBroadcast { message } => ClientEvent::Chat(message),
        ServerFrame::UserJoined { participant } => ClientEvent::UserJoined(participant),
        ServerFrame::UserLeft { user_id } => ClientEvent::UserLeft { user_id },
        ServerFrame::ElementLocked {
            element_id,
            user_id,
        } => ClientEvent::ElementLocked {
            element_id,
            user_id,
        },
        ServerFrame::ElementUnlocked { element_id } => {
            ClientEvent::ElementUnlocked { element_id }
        }
        ServerFrame::CursorMoved { user_id, x, y } => ClientEvent::CursorMoved { user_id, x, y },
        ServerFrame::SelectionChanged {
            user_id,
            element_ids,
        } => ClientEvent::SelectionChanged {
            user_id,
            element_ids,
        },
        ServerFrame::Busy => ClientEvent::Busy,
    };
    let _ = shared.event_tx.send(event).await;
    true
}

/// Bounded reconnection: exponential backoff, at most
/// `max_reconnect_attempts` tries, each re-joining for full state.
fn reconnect_loop(shared: Arc<ClientShared>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
    let max = shared.config.max_reconnect_attempts;
    for attempt in 1..=max {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        *shared.state.write().await = ConnectionState::Reconnecting;
        shared.status.write().await.reconnect_attempts = attempt;

        let delay = backoff_delay(&shared.config, attempt);
        log::info!("reconnect attempt {attempt}/{max} in {delay:?}");
        tokio::time::sleep(delay).await;

        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match establish(shared.clone()).await {
            Ok(()) => return,
            Err(e) => {
                log::warn!("reconnect attempt {attempt} failed: {e}");
                shared.status.write().await.last_error = Some(e.to_string());
            }
        }
    }

    log::warn!("giving up after {max} reconnect attempts");
    *shared.state.write().await = ConnectionState::Disconnected;
    let _ = shared
        .event_tx
        .send(ClientEvent::ReconnectFailed { attempts: max })
        .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new(
            "ws://127.0.0.1:9090",
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Alice",
        )
    }

    #[test]
    fn test_client_creation() {
        let cfg = config();
        let user_id = cfg.user_id;
        let project_id = cfg.project_id;
        let client = CollabClient::new(cfg);
        assert_eq!(client.user_id(), user_id);
        assert_eq!(client.project_id(), project_id);
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = CollabClient::new(config());
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        let status = client.status().await;
        assert!(!status.connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut client = CollabClient::new(config());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = CollabClient::new(config());
        assert!(matches!(
            client.send_chat("hello").await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.send_lock_request("sofa_1".into()).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_cursor_is_fire_and_forget_offline() {
        let client = CollabClient::new(config());
        // Never errors while disconnected; the position just vanishes.
        client.send_cursor(1.0, 2.0).await.unwrap();
        client.send_cursor(3.0, 4.0).await.unwrap();
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let cfg = config();
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(250));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(500));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&cfg, 4), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&cfg, 5), Duration::from_millis(4000));
        // Past the cap, delays stop growing.
        assert_eq!(backoff_delay(&cfg, 6), Duration::from_secs(5));
        assert_eq!(backoff_delay(&cfg, 30), Duration::from_secs(5));
    }

    #[test]
    fn test_default_reconnect_cap_is_five() {
        assert_eq!(config().max_reconnect_attempts, 5);
    }
}
