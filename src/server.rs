//! WebSocket gateway: bridges transport connections to session actors.
//!
//! ```text
//! Client A ──┐
//!            ├── accept loop ── per-connection task ──► SessionActor
//! Client B ──┘                      │        ▲
//!                                   │        │ PeerQueue
//!                                   ▼        │
//!                              read loop   writer loop
//! ```
//!
//! Each connection must open with a `Join` frame carrying the project id
//! and the identity established by the upstream auth layer. After the
//! handshake the read loop translates frames into session commands while
//! a writer loop drains the participant's outbound queue; whichever half
//! ends first tears the connection down and issues `Leave`.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::PeerQueue;
use crate::protocol::{ClientFrame, CursorPosition, MutationEvent, ServerFrame, MAX_USERNAME_LEN};
use crate::registry::SessionRegistry;
use crate::session::{SessionCommand, SessionConfig, SessionError, SessionHandle};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Project allowlist supplied by the pre-validating external system;
    /// `None` accepts any project id.
    pub allowed_projects: Option<Vec<Uuid>>,
    /// Per-session tunables.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            allowed_projects: None,
            session: SessionConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.session.clone()));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections. Runs the accept loop;
    /// call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, stats, config).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.registry.session_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

/// Handle a single WebSocket connection end to end.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let result = serve_connection(
        &mut ws_sender,
        &mut ws_receiver,
        addr,
        &registry,
        &stats,
        &config,
    )
    .await;

    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    registry.prune().await;
    result
}

async fn serve_connection(
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    addr: SocketAddr,
    registry: &Arc<SessionRegistry>,
    stats: &Arc<RwLock<ServerStats>>,
    config: &ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // The first frame must be Join; identity was established upstream.
    let (project_id, user_id, username) = match read_join(ws_receiver).await {
        Some(join) => join,
        None => {
            log::warn!("connection from {addr} closed before a valid Join");
            return Ok(());
        }
    };

    if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
        reject(ws_sender, "invalid username").await;
        return Ok(());
    }
    if let Some(allowed) = &config.allowed_projects {
        if !allowed.contains(&project_id) {
            log::warn!("join from {addr} rejected: unknown project {project_id}");
            reject(ws_sender, "unknown project").await;
            return Ok(());
        }
    }

    // Resolve the session, retrying past handles whose actor tore down
    // between lookup and join.
    let mut attempts = 0;
    let (session, snapshot, queue) = loop {
        let handle: SessionHandle = registry.get_or_create(project_id).await;
        match handle.join(user_id, username.clone()).await {
            Ok((snapshot, queue)) => break (handle, snapshot, queue),
            Err(SessionError::Closed) if attempts < 3 => {
                attempts += 1;
                registry.prune().await;
            }
            Err(e) => {
                reject(ws_sender, "session unavailable").await;
                return Err(Box::new(e));
            }
        }
    };

    // JoinAck goes out before the writer loop starts, so the initial sync
    // is always the first frame the client sees.
    let ack = ServerFrame::JoinAck { snapshot }.encode()?;
    if ws_sender.send(Message::Binary(ack.into())).await.is_err() {
        session
            .submit_wait(SessionCommand::Leave {
                user_id,
                immediate: false,
                connection: Some(queue.clone()),
            })
            .await
            .ok();
        return Ok(());
    }

    // Writer: drains the peer queue in actor-assigned order. The queue
    // closing (leave, slow-peer drop, rejoin elsewhere, session teardown)
    // terminates the connection.
    let writer_queue = queue.clone();
    let writer = async move {
        while let Some(bytes) = writer_queue.pop().await {
            if ws_sender
                .send(Message::Binary(bytes.to_vec().into()))
                .await
                .is_err()
            {
                return;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    };

    // Reader: translate frames into session commands. Returns whether the
    // client left explicitly.
    let reader = async {
        loop {
            let msg = match ws_receiver.next().await {
                Some(msg) => msg,
                None => break false,
            };
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    {
                        let mut s = stats.write().await;
                        s.total_frames += 1;
                        s.total_bytes += bytes.len() as u64;
                    }
                    let frame = match ClientFrame::decode(&bytes) {
                        Ok(frame) => frame,
                        Err(e) => {
                            // Malformed frames never kill the connection.
                            log::warn!("failed to decode frame from {addr}: {e}");
                            continue;
                        }
                    };
                    match dispatch_frame(frame, user_id, &session, &queue) {
                        Dispatch::Continue => {}
                        Dispatch::Leave => break true,
                        Dispatch::SessionGone => break false,
                    }
                }
                Ok(Message::Close(_)) => {
                    log::info!("connection closed from {addr}");
                    break false;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("WebSocket error from {addr}: {e}");
                    break false;
                }
            }
        }
    };

    // Whichever half ends first tears the connection down.
    let explicit_leave = tokio::select! {
        left = reader => left,
        () = writer => false,
    };

    if !explicit_leave {
        // Transport drop: mark inactive, keep the entry for the grace
        // window so a quick reconnect resumes cleanly.
        session
            .submit_wait(SessionCommand::Leave {
                user_id,
                immediate: false,
                connection: Some(queue.clone()),
            })
            .await
            .ok();
    }
    queue.close();
    log::info!("{username} ({user_id}) disconnected from {addr}");
    Ok(())
}

enum Dispatch {
    Continue,
    Leave,
    SessionGone,
}

fn dispatch_frame(
    frame: ClientFrame,
    user_id: Uuid,
    session: &SessionHandle,
    queue: &Arc<PeerQueue>,
) -> Dispatch {
    let command = match frame {
        ClientFrame::Join { .. } => {
            log::warn!("duplicate Join from {user_id} ignored");
            return Dispatch::Continue;
        }
        ClientFrame::Leave => {
            let _ = session.submit(SessionCommand::Leave {
                user_id,
                immediate: true,
                connection: Some(queue.clone()),
            });
            return Dispatch::Leave;
        }
        ClientFrame::CursorUpdate { x, y } => {
            // Fire-and-forget: under backpressure the update is dropped,
            // never retried; a newer one supersedes it.
            let _ = session.submit(SessionCommand::UpdateCursor {
                user_id,
                position: CursorPosition::new(x, y),
            });
            return Dispatch::Continue;
        }
        ClientFrame::SelectionUpdate { element_ids } => SessionCommand::UpdateSelection {
            user_id,
            element_ids,
        },
        ClientFrame::LockRequest { element_id } => SessionCommand::Lock {
            user_id,
            element_id,
        },
        ClientFrame::UnlockRequest { element_id } => SessionCommand::Unlock {
            user_id,
            element_id,
        },
        ClientFrame::FurnitureAdd { item } => SessionCommand::Mutate {
            user_id,
            event: MutationEvent::FurnitureAdded { item },
        },
        ClientFrame::FurnitureMove { element_id, x, y } => SessionCommand::Mutate {
            user_id,
            event: MutationEvent::FurnitureMoved { element_id, x, y },
        },
        ClientFrame::FurnitureRemove { element_id } => SessionCommand::Mutate {
            user_id,
            event: MutationEvent::FurnitureRemoved { element_id },
        },
        ClientFrame::DesignUpdate { patch } => SessionCommand::Mutate {
            user_id,
            event: MutationEvent::DesignUpdated { patch },
        },
        ClientFrame::ChatSend { text } => SessionCommand::Chat { user_id, text },
    };

    match session.submit(command) {
        Ok(()) => Dispatch::Continue,
        Err(SessionError::Busy) => {
            // Backpressure surfaces to the client as a retryable Busy.
            queue.push_frame(&ServerFrame::Busy);
            Dispatch::Continue
        }
        Err(SessionError::Closed) => Dispatch::SessionGone,
    }
}

async fn read_join(ws_receiver: &mut WsSource) -> Option<(Uuid, Uuid, String)> {
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                return match ClientFrame::decode(&bytes) {
                    Ok(ClientFrame::Join {
                        project_id,
                        user_id,
                        username,
                    }) => Some((project_id, user_id, username)),
                    Ok(other) => {
                        log::warn!("first frame was {other:?}, expected Join");
                        None
                    }
                    Err(e) => {
                        log::warn!("undecodable first frame: {e}");
                        None
                    }
                };
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn reject(ws_sender: &mut WsSink, reason: &str) {
    if let Ok(bytes) = (ServerFrame::JoinRejected {
        reason: reason.to_string(),
    })
    .encode()
    {
        let _ = ws_sender.send(Message::Binary(bytes.into())).await;
    }
    let _ = ws_sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert!(config.allowed_projects.is_none());
        assert_eq!(config.session.lock_ttl, std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_server_creation() {
        let server = CollabServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = CollabServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.active_sessions, 0);
    }

    #[test]
    fn test_server_custom_config() {
        let project = Uuid::new_v4();
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            allowed_projects: Some(vec![project]),
            session: SessionConfig::default(),
        };
        let server = CollabServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }
}
