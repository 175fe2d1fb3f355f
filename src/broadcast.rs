//! Fan-out of accepted session events to per-peer outbound queues.
//!
//! Each connected participant owns one bounded [`PeerQueue`], drained by
//! that connection's writer task. The session actor pushes pre-encoded
//! frames (`Arc<Vec<u8>>`, encoded once per broadcast) so fan-out never
//! re-serializes.
//!
//! Backpressure policy per queue:
//! - ephemeral frames (cursor moves) are dropped when the queue is full,
//!   oldest first;
//! - a durable frame that still does not fit closes the queue, which
//!   disconnects the slow peer — durable events are never silently lost.
//!
//! Delivery order per recipient equals the actor's assignment order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::protocol::ServerFrame;

/// A frame staged for one peer.
#[derive(Clone)]
struct Outbound {
    bytes: Arc<Vec<u8>>,
    ephemeral: bool,
}

/// Result of staging a frame on a peer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Queued,
    /// Queue full; an ephemeral frame was discarded to make room, or the
    /// pushed ephemeral frame itself was dropped.
    DroppedEphemeral,
    /// Queue full of durable frames and the pushed frame was durable —
    /// the queue is now closed and the peer must be disconnected.
    Overflowed,
    /// Queue already closed.
    Closed,
}

struct QueueInner {
    frames: VecDeque<Outbound>,
    closed: bool,
}

/// Bounded outbound queue bridging the session actor to one connection's
/// writer task.
pub struct PeerQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl PeerQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, frame: Outbound) -> PushResult {
        let result = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed {
                return PushResult::Closed;
            }
            if inner.frames.len() < self.capacity {
                inner.frames.push_back(frame);
                PushResult::Queued
            } else {
                match inner.frames.iter().position(|f| f.ephemeral) {
                    // Evict the oldest queued ephemeral: a newer cursor
                    // position supersedes it, and durable frames get
                    // room without loss.
                    Some(idx) => {
                        inner.frames.remove(idx);
                        inner.frames.push_back(frame);
                        PushResult::DroppedEphemeral
                    }
                    // Nothing evictable and the new frame is ephemeral:
                    // drop it, a later update will get through.
                    None if frame.ephemeral => PushResult::DroppedEphemeral,
                    None => {
                        inner.closed = true;
                        inner.frames.clear();
                        PushResult::Overflowed
                    }
                }
            }
        };
        self.notify.notify_one();
        result
    }

    /// Next frame to write, in push order. `None` once the queue is closed
    /// and drained — the writer task then shuts the connection down.
    pub async fn pop(&self) -> Option<Arc<Vec<u8>>> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame.bytes);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue; the writer task wakes and terminates the
    /// connection after draining what is already staged.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.closed = true;
        }
        self.notify.notify_one();
    }

    /// Stage a frame directly, bypassing the broadcaster. Used by the
    /// gateway for connection-local frames (`Busy`).
    pub fn push_frame(&self, frame: &ServerFrame) -> PushResult {
        let Ok(bytes) = frame.encode() else {
            return PushResult::Queued;
        };
        self.push(Outbound {
            bytes: Arc::new(bytes),
            ephemeral: frame.is_ephemeral(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).frames.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Fan-out statistics for monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub ephemeral_dropped: u64,
    pub slow_peers_disconnected: u64,
}

/// Routes accepted events from the session actor to peer queues.
///
/// Owned by the actor task — a plain map, no locking needed.
pub struct Broadcaster {
    peers: HashMap<Uuid, Arc<PeerQueue>>,
    stats: BroadcastStats,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            stats: BroadcastStats::default(),
        }
    }

    /// Attach a peer's queue. A previous queue for the same user (zombie
    /// connection racing a rejoin) is closed so its writer exits.
    pub fn insert_peer(&mut self, user_id: Uuid, queue: Arc<PeerQueue>) {
        if let Some(old) = self.peers.insert(user_id, queue) {
            old.close();
        }
    }

    /// Close every queue; called when the session tears down so writer
    /// tasks terminate their connections.
    pub fn close_all(&mut self) {
        for queue in self.peers.values() {
            queue.close();
        }
        self.peers.clear();
    }

    /// Detach and close a peer's queue.
    pub fn remove_peer(&mut self, user_id: &Uuid) {
        if let Some(queue) = self.peers.remove(user_id) {
            queue.close();
        }
    }

    pub fn has_peer(&self, user_id: &Uuid) -> bool {
        self.peers.contains_key(user_id)
    }

    /// The queue currently registered for a peer, if any. Lets the actor
    /// tell a live connection from a zombie one racing a rejoin.
    pub fn peer_queue(&self, user_id: &Uuid) -> Option<&Arc<PeerQueue>> {
        self.peers.get(user_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Deliver a frame to one peer. Returns `false` when the peer's queue
    /// overflowed on a durable frame and the peer must be dropped.
    pub fn send_to(&mut self, user_id: &Uuid, frame: &ServerFrame) -> bool {
        let Ok(bytes) = frame.encode() else {
            return true;
        };
        let outbound = Outbound {
            bytes: Arc::new(bytes),
            ephemeral: frame.is_ephemeral(),
        };
        self.push_to(user_id, outbound)
    }

    /// Fan a frame out to every attached peer, skipping `except` (the
    /// origin, for mutation and presence frames; `None` for chat).
    /// Returns the peers whose queues overflowed on a durable frame.
    pub fn broadcast(&mut self, frame: &ServerFrame, except: Option<Uuid>) -> Vec<Uuid> {
        let Ok(bytes) = frame.encode() else {
            return Vec::new();
        };
        let outbound = Outbound {
            bytes: Arc::new(bytes),
            ephemeral: frame.is_ephemeral(),
        };

        let targets: Vec<Uuid> = self
            .peers
            .keys()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect();

        let mut overflowed = Vec::new();
        for user_id in targets {
            if !self.push_to(&user_id, outbound.clone()) {
                overflowed.push(user_id);
            }
        }
        overflowed
    }

    fn push_to(&mut self, user_id: &Uuid, outbound: Outbound) -> bool {
        let Some(queue) = self.peers.get(user_id) else {
            return true;
        };
        match queue.push(outbound) {
            PushResult::Queued => {
                self.stats.frames_sent += 1;
                true
            }
            PushResult::DroppedEphemeral => {
                self.stats.ephemeral_dropped += 1;
                true
            }
            PushResult::Overflowed => {
                self.stats.slow_peers_disconnected += 1;
                false
            }
            PushResult::Closed => true,
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChatMessage;

    fn cursor_frame() -> ServerFrame {
        ServerFrame::CursorMoved {
            user_id: Uuid::new_v4(),
            x: 1.0,
            y: 2.0,
        }
    }

    fn chat_frame(sequence: u64) -> ServerFrame {
        ServerFrame::ChatBroadcast {
            message: ChatMessage {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                username: "Alice".into(),
                text: format!("msg {sequence}"),
                timestamp_ms: 0,
                sequence,
            },
        }
    }

    #[tokio::test]
    async fn test_fan_out_skips_origin() {
        let mut b = Broadcaster::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let qa = Arc::new(PeerQueue::new(8));
        let qb = Arc::new(PeerQueue::new(8));
        b.insert_peer(alice, qa.clone());
        b.insert_peer(bob, qb.clone());

        let overflowed = b.broadcast(&chat_frame(1), Some(alice));
        assert!(overflowed.is_empty());
        assert_eq!(qa.len(), 0);
        assert_eq!(qb.len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_order_matches_push_order() {
        let mut b = Broadcaster::new();
        let bob = Uuid::new_v4();
        let qb = Arc::new(PeerQueue::new(16));
        b.insert_peer(bob, qb.clone());

        for seq in 1..=5 {
            b.broadcast(&chat_frame(seq), None);
        }
        for expected in 1..=5u64 {
            let bytes = qb.pop().await.unwrap();
            match ServerFrame::decode(&bytes).unwrap() {
                ServerFrame::ChatBroadcast { message } => assert_eq!(message.sequence, expected),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_ephemeral_first() {
        let mut b = Broadcaster::new();
        let bob = Uuid::new_v4();
        let qb = Arc::new(PeerQueue::new(2));
        b.insert_peer(bob, qb.clone());

        // One durable + one ephemeral fills the queue.
        b.broadcast(&chat_frame(1), None);
        b.broadcast(&cursor_frame(), None);
        assert_eq!(qb.len(), 2);

        // A durable frame evicts the queued cursor instead of overflowing.
        let overflowed = b.broadcast(&chat_frame(2), None);
        assert!(overflowed.is_empty());
        assert_eq!(qb.len(), 2);

        // Remaining frames are the two durable ones, in order.
        for expected in 1..=2u64 {
            let bytes = qb.pop().await.unwrap();
            match ServerFrame::decode(&bytes).unwrap() {
                ServerFrame::ChatBroadcast { message } => assert_eq!(message.sequence, expected),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_ephemeral_dropped_when_full_of_durable() {
        let mut b = Broadcaster::new();
        let bob = Uuid::new_v4();
        let qb = Arc::new(PeerQueue::new(2));
        b.insert_peer(bob, qb.clone());

        b.broadcast(&chat_frame(1), None);
        b.broadcast(&chat_frame(2), None);
        let overflowed = b.broadcast(&cursor_frame(), None);
        assert!(overflowed.is_empty());
        assert_eq!(qb.len(), 2);
        assert_eq!(b.stats().ephemeral_dropped, 1);
    }

    #[tokio::test]
    async fn test_cursor_churn_keeps_most_recent() {
        let mut b = Broadcaster::new();
        let bob = Uuid::new_v4();
        let qb = Arc::new(PeerQueue::new(2));
        b.insert_peer(bob, qb.clone());

        let origin = Uuid::new_v4();
        for i in 0..20 {
            b.broadcast(
                &ServerFrame::CursorMoved {
                    user_id: origin,
                    x: i as f32,
                    y: 0.0,
                },
                None,
            );
        }
        // Oldest positions were evicted; the last frame staged is the
        // most recent cursor position.
        assert_eq!(qb.len(), 2);
        let mut last_x = None;
        while qb.len() > 0 {
            let bytes = qb.pop().await.unwrap();
            if let ServerFrame::CursorMoved { x, .. } = ServerFrame::decode(&bytes).unwrap() {
                last_x = Some(x);
            }
        }
        assert_eq!(last_x, Some(19.0));
    }

    #[tokio::test]
    async fn test_durable_overflow_closes_queue() {
        let mut b = Broadcaster::new();
        let bob = Uuid::new_v4();
        let qb = Arc::new(PeerQueue::new(2));
        b.insert_peer(bob, qb.clone());

        b.broadcast(&chat_frame(1), None);
        b.broadcast(&chat_frame(2), None);
        let overflowed = b.broadcast(&chat_frame(3), None);

        assert_eq!(overflowed, vec![bob]);
        assert!(qb.is_closed());
        assert!(qb.pop().await.is_none());
        assert_eq!(b.stats().slow_peers_disconnected, 1);
    }

    #[tokio::test]
    async fn test_remove_peer_closes_queue() {
        let mut b = Broadcaster::new();
        let bob = Uuid::new_v4();
        let qb = Arc::new(PeerQueue::new(4));
        b.insert_peer(bob, qb.clone());
        b.remove_peer(&bob);

        assert!(!b.has_peer(&bob));
        assert!(qb.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_reinsert_closes_previous_queue() {
        let mut b = Broadcaster::new();
        let bob = Uuid::new_v4();
        let old = Arc::new(PeerQueue::new(4));
        let new = Arc::new(PeerQueue::new(4));
        b.insert_peer(bob, old.clone());
        b.insert_peer(bob, new.clone());

        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(b.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(PeerQueue::new(4));
        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.pop().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let mut b = Broadcaster::new();
        let bob = Uuid::new_v4();
        b.insert_peer(bob, queue.clone());
        b.send_to(&bob, &chat_frame(9));

        let bytes = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(ServerFrame::decode(&bytes).is_ok());
    }
}
