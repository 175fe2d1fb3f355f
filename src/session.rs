//! The session actor: sole mutator of one project's shared state.
//!
//! ```text
//! Gateway A ──┐                 ┌── PeerQueue A ── writer A
//!             ├──► mpsc inbox ──┤
//! Gateway B ──┘        │        └── PeerQueue B ── writer B
//!                      ▼
//!              SessionActor task
//!              (participants, locks, chat, sequence counter)
//! ```
//!
//! Exactly one actor task exists per live project id. Every intent for the
//! session flows through the inbox and is processed one at a time, which
//! makes event ordering total within the session without any mutex
//! discipline. The actor never touches network I/O — accepted events are
//! staged on per-peer queues and written by the gateways.
//!
//! A periodic sweep expires lock TTLs, retires participants whose grace
//! period lapsed, and tears the session down once it has been empty for a
//! full grace period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::broadcast::{Broadcaster, PeerQueue};
use crate::chat::{now_ms, ChatLog};
use crate::locks::{LockOutcome, LockTable};
use crate::presence::ParticipantTable;
use crate::protocol::{
    ChatMessage, CursorPosition, ElementId, MutationEvent, ServerFrame, SessionSnapshot,
    MAX_CHAT_LEN,
};

/// Tunables for one session. Defaults mirror the product's behavior: a
/// ~1s lock auto-release after a drag and a 30s reconnect grace window.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Advisory lock lifetime; refreshed by holder activity.
    pub lock_ttl: Duration,
    /// How long a disconnected participant blocks teardown and may rejoin
    /// without being forgotten.
    pub grace_period: Duration,
    /// Cadence of the TTL/grace sweep inside the actor loop.
    pub sweep_interval: Duration,
    /// Bound on the actor's command inbox; overflow surfaces as `Busy`.
    pub command_capacity: usize,
    /// Bound on each participant's outbound frame queue.
    pub outbound_capacity: usize,
    /// Retained chat history shipped to joining clients.
    pub chat_history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(1),
            grace_period: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(250),
            command_capacity: 256,
            outbound_capacity: 64,
            chat_history_limit: 500,
        }
    }
}

/// Session-level failures surfaced to gateways.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Inbox saturated; the intent was not applied and may be retried.
    #[error("session inbox full, retry")]
    Busy,
    /// The actor has torn down; re-resolve the session via the registry.
    #[error("session closed")]
    Closed,
}

/// Intents processed one at a time by the actor.
pub enum SessionCommand {
    Join {
        user_id: Uuid,
        username: String,
        reply: oneshot::Sender<(SessionSnapshot, Arc<PeerQueue>)>,
    },
    /// `immediate` distinguishes an explicit Leave frame (remove now) from
    /// a transport drop (inactive, removal after grace). A gateway sets
    /// `connection` to its own queue so a Leave from a dead connection
    /// cannot deactivate a participant who already rejoined; `None`
    /// applies unconditionally.
    Leave {
        user_id: Uuid,
        immediate: bool,
        connection: Option<Arc<PeerQueue>>,
    },
    UpdateCursor {
        user_id: Uuid,
        position: CursorPosition,
    },
    UpdateSelection {
        user_id: Uuid,
        element_ids: Vec<ElementId>,
    },
    Lock {
        user_id: Uuid,
        element_id: ElementId,
    },
    Unlock {
        user_id: Uuid,
        element_id: ElementId,
    },
    Mutate {
        user_id: Uuid,
        event: MutationEvent,
    },
    Chat { user_id: Uuid, text: String },
}

/// Cloneable handle used by gateways to reach a session actor.
#[derive(Clone)]
pub struct SessionHandle {
    project_id: Uuid,
    tx: mpsc::Sender<SessionCommand>,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    /// True once the actor has torn down; the registry replaces such
    /// handles on the next join.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a participant and receive the initial sync plus the
    /// outbound queue to drain. Waits for inbox room rather than failing
    /// under transient load.
    pub async fn join(
        &self,
        user_id: Uuid,
        username: String,
    ) -> Result<(SessionSnapshot, Arc<PeerQueue>), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Join {
                user_id,
                username,
                reply,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Like `submit`, but waits for inbox room. Used for intents that
    /// must not be lost to transient backpressure (the disconnect Leave).
    pub async fn submit_wait(&self, command: SessionCommand) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.tx
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Submit a fire-and-forget intent. `Busy` is retryable; callers drop
    /// ephemeral intents on `Busy` instead of retrying.
    pub fn submit(&self, command: SessionCommand) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::Busy,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }
}

/// Spawn the actor task for a project and return its handle.
pub fn spawn_session(project_id: Uuid, config: SessionConfig) -> SessionHandle {
    let (tx, rx) = mpsc::channel(config.command_capacity);
    let closed = Arc::new(AtomicBool::new(false));
    let actor = SessionActor {
        project_id,
        participants: ParticipantTable::new(),
        locks: LockTable::new(config.lock_ttl),
        chat: ChatLog::new(config.chat_history_limit),
        broadcaster: Broadcaster::new(),
        next_sequence: 0,
        empty_since: Some(Instant::now()),
        pending_drops: Vec::new(),
        closed: closed.clone(),
        config,
    };
    tokio::spawn(actor.run(rx));
    SessionHandle {
        project_id,
        tx,
        closed,
    }
}

struct SessionActor {
    project_id: Uuid,
    config: SessionConfig,
    participants: ParticipantTable,
    locks: LockTable,
    chat: ChatLog,
    broadcaster: Broadcaster,
    next_sequence: u64,
    /// Set while the participant table is empty; drives teardown.
    empty_since: Option<Instant>,
    /// Peers whose outbound queue overflowed on a durable frame; drained
    /// after every command.
    pending_drops: Vec<Uuid>,
    closed: Arc<AtomicBool>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        log::info!("session {} started", self.project_id);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => {
                        self.handle(command);
                        self.process_drops();
                    }
                    // Every handle dropped: nothing can ever join again.
                    None => break,
                },
                _ = sweep.tick() => {
                    self.sweep(Instant::now());
                    self.process_drops();
                    if self.should_tear_down(Instant::now()) {
                        // A join may already sit in the inbox; it clears
                        // empty_since, so drain before deciding.
                        while let Ok(command) = rx.try_recv() {
                            self.handle(command);
                            self.process_drops();
                        }
                        if self.should_tear_down(Instant::now()) {
                            break;
                        }
                    }
                }
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        self.broadcaster.close_all();
        rx.close();
        // Pending joins see their reply channel drop and retry through the
        // registry against a fresh session.
        log::info!("session {} torn down", self.project_id);
    }

    fn should_tear_down(&self, now: Instant) -> bool {
        self.participants.is_empty()
            && self
                .empty_since
                .map(|t| now.duration_since(t) >= self.config.grace_period)
                .unwrap_or(false)
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Join {
                user_id,
                username,
                reply,
            } => self.handle_join(user_id, username, reply),
            SessionCommand::Leave {
                user_id,
                immediate,
                connection,
            } => self.handle_leave(user_id, immediate, connection),
            SessionCommand::UpdateCursor { user_id, position } => {
                self.handle_cursor(user_id, position)
            }
            SessionCommand::UpdateSelection {
                user_id,
                element_ids,
            } => self.handle_selection(user_id, element_ids),
            SessionCommand::Lock {
                user_id,
                element_id,
            } => self.handle_lock(user_id, element_id),
            SessionCommand::Unlock {
                user_id,
                element_id,
            } => self.handle_unlock(user_id, element_id),
            SessionCommand::Mutate { user_id, event } => self.handle_mutate(user_id, event),
            SessionCommand::Chat { user_id, text } => self.handle_chat(user_id, text),
        }
    }

    fn handle_join(
        &mut self,
        user_id: Uuid,
        username: String,
        reply: oneshot::Sender<(SessionSnapshot, Arc<PeerQueue>)>,
    ) {
        let now = Instant::now();
        let rejoined = self.participants.join(user_id, username.clone(), now);
        self.empty_since = None;

        let queue = Arc::new(PeerQueue::new(self.config.outbound_capacity));
        // Replaces (and closes) any zombie queue from a half-dead
        // connection racing the rejoin.
        self.broadcaster.insert_peer(user_id, queue.clone());

        let snapshot = SessionSnapshot {
            participants: self.participants.snapshot(),
            locks: self.locks.snapshot(now),
            chat_history: self.chat.history(),
        };

        if let Some(participant) = self.participants.get(&user_id) {
            let frame = ServerFrame::UserJoined {
                participant: participant.info(),
            };
            self.fan_out(frame, Some(user_id));
        }

        if reply.send((snapshot, queue)).is_err() {
            // Gateway died between sending Join and reading the reply.
            self.pending_drops.push(user_id);
            return;
        }

        log::info!(
            "{} ({user_id}) {} session {}",
            username,
            if rejoined { "rejoined" } else { "joined" },
            self.project_id
        );
    }

    fn handle_leave(&mut self, user_id: Uuid, immediate: bool, connection: Option<Arc<PeerQueue>>) {
        if !self.participants.contains(&user_id) {
            return;
        }
        // A Leave tagged with a connection only applies while that
        // connection is still the participant's registered one; a zombie
        // gateway must not undo a rejoin (or a slow-peer drop).
        if let Some(conn) = &connection {
            let is_current = self
                .broadcaster
                .peer_queue(&user_id)
                .map(|current| Arc::ptr_eq(current, conn))
                .unwrap_or(false);
            if !is_current {
                log::debug!("ignoring stale leave for {user_id}");
                return;
            }
        }
        let now = Instant::now();

        // Locks release immediately so nobody waits out a dead holder.
        for element_id in self.locks.release_held_by(user_id) {
            self.fan_out(ServerFrame::ElementUnlocked { element_id }, Some(user_id));
        }

        let was_active = self.participants.is_active(&user_id);
        if immediate {
            self.participants.remove(user_id);
        } else {
            self.participants.set_inactive(user_id, now);
        }
        self.broadcaster.remove_peer(&user_id);
        if was_active {
            self.fan_out(ServerFrame::UserLeft { user_id }, Some(user_id));
        }

        if self.participants.is_empty() {
            self.empty_since = Some(now);
        }
        log::info!("{user_id} left session {} (immediate: {immediate})", self.project_id);
    }

    fn handle_cursor(&mut self, user_id: Uuid, position: CursorPosition) {
        if !position.is_valid() {
            log::warn!("dropping malformed cursor update from {user_id}");
            return;
        }
        if !self.participants.set_cursor(user_id, position) {
            log::warn!("cursor update from unknown participant {user_id}");
            return;
        }
        self.fan_out(
            ServerFrame::CursorMoved {
                user_id,
                x: position.x,
                y: position.y,
            },
            Some(user_id),
        );
    }

    fn handle_selection(&mut self, user_id: Uuid, element_ids: Vec<ElementId>) {
        if !self.participants.set_selection(user_id, element_ids.clone()) {
            log::warn!("selection update from unknown participant {user_id}");
            return;
        }
        self.fan_out(
            ServerFrame::SelectionChanged {
                user_id,
                element_ids,
            },
            Some(user_id),
        );
    }

    fn handle_lock(&mut self, user_id: Uuid, element_id: ElementId) {
        if !self.participants.is_active(&user_id) {
            log::warn!("lock request from inactive participant {user_id}");
            return;
        }
        let now = Instant::now();
        match self.locks.try_lock(&element_id, user_id, now) {
            LockOutcome::Granted => {
                self.send_to(
                    user_id,
                    ServerFrame::LockResult {
                        element_id: element_id.clone(),
                        granted: true,
                        holder: None,
                    },
                );
                self.fan_out(
                    ServerFrame::ElementLocked {
                        element_id,
                        user_id,
                    },
                    Some(user_id),
                );
            }
            LockOutcome::Denied { holder } => {
                log::debug!("lock on {element_id} denied for {user_id}, held by {holder}");
                self.send_to(
                    user_id,
                    ServerFrame::LockResult {
                        element_id,
                        granted: false,
                        holder: Some(holder),
                    },
                );
            }
        }
    }

    fn handle_unlock(&mut self, user_id: Uuid, element_id: ElementId) {
        if self.locks.unlock(&element_id, user_id) {
            self.fan_out(ServerFrame::ElementUnlocked { element_id }, Some(user_id));
        }
    }

    fn handle_mutate(&mut self, user_id: Uuid, event: MutationEvent) {
        if !self.participants.is_active(&user_id) {
            log::warn!("mutation from inactive participant {user_id}");
            return;
        }
        if !event.is_valid() {
            log::warn!("dropping malformed mutation from {user_id}");
            return;
        }
        let now = Instant::now();
        if let Some(element_id) = event.locked_element() {
            if let Some(holder) = self.locks.holder(element_id, now) {
                if holder != user_id {
                    log::warn!(
                        "dropping mutation from {user_id}: {element_id} locked by {holder}"
                    );
                    return;
                }
                // Mid-drag activity keeps the holder's lock alive.
                self.locks.touch(element_id, user_id, now);
            }
        }

        self.next_sequence += 1;
        self.fan_out(
            ServerFrame::MutationBroadcast {
                sequence: self.next_sequence,
                origin: user_id,
                event,
            },
            Some(user_id),
        );
    }

    fn handle_chat(&mut self, user_id: Uuid, text: String) {
        let Some(participant) = self.participants.get(&user_id) else {
            log::warn!("chat from unknown participant {user_id}");
            return;
        };
        if text.is_empty() || text.chars().count() > MAX_CHAT_LEN {
            log::warn!("dropping malformed chat message from {user_id}");
            return;
        }

        self.next_sequence += 1;
        let message = ChatMessage {
            id: Uuid::new_v4(),
            user_id,
            username: participant.username.clone(),
            text,
            timestamp_ms: now_ms(),
            sequence: self.next_sequence,
        };
        self.chat.push(message.clone());
        // Chat echoes to the sender too: the sender's UI renders the
        // message with its authoritative sequence number.
        self.fan_out(ServerFrame::ChatBroadcast { message }, None);
    }

    fn sweep(&mut self, now: Instant) {
        for element_id in self.locks.release_expired(now) {
            log::debug!("lock on {element_id} expired in session {}", self.project_id);
            self.fan_out(ServerFrame::ElementUnlocked { element_id }, None);
        }

        // UserLeft already went out when these participants disconnected;
        // retirement is bookkeeping only.
        for user_id in self
            .participants
            .retire_inactive(now, self.config.grace_period)
        {
            self.broadcaster.remove_peer(&user_id);
            log::debug!("retired inactive participant {user_id}");
        }

        if self.participants.is_empty() && self.empty_since.is_none() {
            self.empty_since = Some(now);
        }
    }

    fn fan_out(&mut self, frame: ServerFrame, except: Option<Uuid>) {
        let overflowed = self.broadcaster.broadcast(&frame, except);
        self.pending_drops.extend(overflowed);
    }

    fn send_to(&mut self, user_id: Uuid, frame: ServerFrame) {
        if !self.broadcaster.send_to(&user_id, &frame) {
            self.pending_drops.push(user_id);
        }
    }

    /// Disconnect peers whose queue overflowed on a durable frame. The
    /// resulting UserLeft/ElementUnlocked fan-out may overflow further
    /// peers; the worklist converges because each pass removes a peer.
    fn process_drops(&mut self) {
        while let Some(user_id) = self.pending_drops.pop() {
            if !self.broadcaster.has_peer(&user_id) {
                continue;
            }
            log::warn!(
                "disconnecting slow participant {user_id} from session {}",
                self.project_id
            );
            self.broadcaster.remove_peer(&user_id);
            for element_id in self.locks.release_held_by(user_id) {
                self.fan_out(ServerFrame::ElementUnlocked { element_id }, Some(user_id));
            }
            self.participants.set_inactive(user_id, Instant::now());
            self.fan_out(ServerFrame::UserLeft { user_id }, Some(user_id));
        }
    }
}
