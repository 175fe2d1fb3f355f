//! Binary wire protocol for the collaborative session engine.
//!
//! All frames are bincode-encoded over binary WebSocket messages:
//! [`ClientFrame`] flows client → server, [`ServerFrame`] flows back.
//!
//! ```text
//! ┌────────────────┐  ClientFrame   ┌────────────────┐
//! │ CollabClient   │ ─────────────► │ CollabServer   │
//! │ (per user)     │ ◄───────────── │ (gateway)      │
//! └────────────────┘  ServerFrame   └────────────────┘
//! ```
//!
//! Mutation and chat frames come back with a server-assigned sequence
//! number; cursor traffic is unsequenced and best-effort.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a single design element ("sofa_1", "lamp_3", ...).
pub type ElementId = String;

/// Maximum accepted chat message length, in characters.
pub const MAX_CHAT_LEN: usize = 2000;

/// Maximum accepted username length, in characters.
pub const MAX_USERNAME_LEN: usize = 64;

/// Ephemeral 2D cursor position in room coordinates.
///
/// Last-write-wins; never sequenced into the event log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f32,
    pub y: f32,
}

impl CursorPosition {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Positions with NaN/infinite coordinates are rejected at the gateway.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// A placed furniture item — the design payload carried by add events
/// and the reconciler's local view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FurnitureItem {
    pub element_id: ElementId,
    /// Catalog kind ("sofa", "floor_lamp", ...).
    pub kind: String,
    pub x: f32,
    pub y: f32,
    /// Rotation around the vertical axis, degrees.
    pub rotation: f32,
}

impl FurnitureItem {
    pub fn is_valid(&self) -> bool {
        !self.element_id.is_empty()
            && !self.kind.is_empty()
            && self.x.is_finite()
            && self.y.is_finite()
            && self.rotation.is_finite()
    }
}

/// A sequenceable change to the shared design.
///
/// Immutable once the session actor assigns a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationEvent {
    FurnitureAdded { item: FurnitureItem },
    FurnitureMoved { element_id: ElementId, x: f32, y: f32 },
    FurnitureRemoved { element_id: ElementId },
    /// Document-level settings patch (room dimensions, wall finish, ...),
    /// opaque to the engine.
    DesignUpdated { patch: String },
}

impl MutationEvent {
    /// Structural validation. Malformed events are logged and dropped by
    /// the session actor, never broadcast.
    pub fn is_valid(&self) -> bool {
        match self {
            MutationEvent::FurnitureAdded { item } => item.is_valid(),
            MutationEvent::FurnitureMoved { element_id, x, y } => {
                !element_id.is_empty() && x.is_finite() && y.is_finite()
            }
            MutationEvent::FurnitureRemoved { element_id } => !element_id.is_empty(),
            MutationEvent::DesignUpdated { patch } => !patch.is_empty(),
        }
    }

    /// The element whose advisory lock gates this event, if any.
    ///
    /// Moving or removing an element another user holds is rejected;
    /// adding a new element and document-level updates are lock-free.
    pub fn locked_element(&self) -> Option<&ElementId> {
        match self {
            MutationEvent::FurnitureMoved { element_id, .. }
            | MutationEvent::FurnitureRemoved { element_id } => Some(element_id),
            MutationEvent::FurnitureAdded { .. } | MutationEvent::DesignUpdated { .. } => None,
        }
    }
}

/// One chat message in the session's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub text: String,
    /// Unix epoch milliseconds, server clock.
    pub timestamp_ms: u64,
    /// Shares the session's mutation sequence space.
    pub sequence: u64,
}

/// Snapshot of one participant, as shipped in `JoinAck` and `UserJoined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub username: String,
    pub is_active: bool,
    pub cursor: Option<CursorPosition>,
    pub selected_elements: Vec<ElementId>,
}

/// Snapshot of one active element lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub element_id: ElementId,
    pub holder: Uuid,
}

/// Full session state returned to a joining client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub participants: Vec<ParticipantInfo>,
    pub locks: Vec<LockInfo>,
    pub chat_history: Vec<ChatMessage>,
}

/// Client → server intents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Must be the first frame on a connection. Identity comes from the
    /// upstream auth layer; the engine does not re-verify it.
    Join {
        project_id: Uuid,
        user_id: Uuid,
        username: String,
    },
    /// Clean exit: the participant is removed immediately, not after grace.
    Leave,
    /// Fire-and-forget; no ack, never retried.
    CursorUpdate { x: f32, y: f32 },
    SelectionUpdate { element_ids: Vec<ElementId> },
    LockRequest { element_id: ElementId },
    UnlockRequest { element_id: ElementId },
    FurnitureAdd { item: FurnitureItem },
    FurnitureMove { element_id: ElementId, x: f32, y: f32 },
    FurnitureRemove { element_id: ElementId },
    DesignUpdate { patch: String },
    ChatSend { text: String },
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Initial sync for the joining client.
    JoinAck { snapshot: SessionSnapshot },
    /// Join refused (unknown project, bad first frame); the connection is
    /// closed right after this frame.
    JoinRejected { reason: String },
    /// Reply to `LockRequest`, sent only to the requester. A denial names
    /// the current holder.
    LockResult {
        element_id: ElementId,
        granted: bool,
        holder: Option<Uuid>,
    },
    /// A sequenced design mutation, fanned out to everyone but the origin.
    MutationBroadcast {
        sequence: u64,
        origin: Uuid,
        event: MutationEvent,
    },
    /// A sequenced chat message, fanned out to everyone including the
    /// sender.
    ChatBroadcast { message: ChatMessage },
    UserJoined { participant: ParticipantInfo },
    UserLeft { user_id: Uuid },
    ElementLocked { element_id: ElementId, user_id: Uuid },
    ElementUnlocked { element_id: ElementId },
    /// Ephemeral; may be dropped under backpressure.
    CursorMoved { user_id: Uuid, x: f32, y: f32 },
    SelectionChanged {
        user_id: Uuid,
        element_ids: Vec<ElementId>,
    },
    /// The session actor's inbox is saturated; the intent was not applied
    /// and may be retried.
    Busy,
}

impl ServerFrame {
    /// Ephemeral frames are dropped first when a peer's outbound queue
    /// fills; everything else must reach the peer or disconnect it.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, ServerFrame::CursorMoved { .. })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

/// Wire-level failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sofa() -> FurnitureItem {
        FurnitureItem {
            element_id: "sofa_1".into(),
            kind: "sofa".into(),
            x: 1.5,
            y: 2.0,
            rotation: 90.0,
        }
    }

    #[test]
    fn test_client_frame_roundtrip() {
        let frame = ClientFrame::Join {
            project_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            username: "Alice".into(),
        };
        let encoded = frame.encode().unwrap();
        let decoded = ClientFrame::decode(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_mutation_broadcast_roundtrip() {
        let origin = Uuid::new_v4();
        let frame = ServerFrame::MutationBroadcast {
            sequence: 7,
            origin,
            event: MutationEvent::FurnitureMoved {
                element_id: "sofa_1".into(),
                x: 3.0,
                y: 4.0,
            },
        };
        let encoded = frame.encode().unwrap();
        match ServerFrame::decode(&encoded).unwrap() {
            ServerFrame::MutationBroadcast { sequence, origin: o, event } => {
                assert_eq!(sequence, 7);
                assert_eq!(o, origin);
                assert_eq!(
                    event,
                    MutationEvent::FurnitureMoved {
                        element_id: "sofa_1".into(),
                        x: 3.0,
                        y: 4.0,
                    }
                );
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_join_ack_roundtrip() {
        let frame = ServerFrame::JoinAck {
            snapshot: SessionSnapshot {
                participants: vec![ParticipantInfo {
                    user_id: Uuid::new_v4(),
                    username: "Bob".into(),
                    is_active: true,
                    cursor: Some(CursorPosition::new(1.0, 2.0)),
                    selected_elements: vec!["sofa_1".into()],
                }],
                locks: vec![LockInfo {
                    element_id: "sofa_1".into(),
                    holder: Uuid::new_v4(),
                }],
                chat_history: vec![ChatMessage {
                    id: Uuid::new_v4(),
                    user_id: Uuid::new_v4(),
                    username: "Bob".into(),
                    text: "hi".into(),
                    timestamp_ms: 123,
                    sequence: 1,
                }],
            },
        };
        let decoded = ServerFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_mutation_validation() {
        assert!(MutationEvent::FurnitureAdded { item: sofa() }.is_valid());
        assert!(!MutationEvent::FurnitureMoved {
            element_id: "".into(),
            x: 0.0,
            y: 0.0
        }
        .is_valid());
        assert!(!MutationEvent::FurnitureMoved {
            element_id: "sofa_1".into(),
            x: f32::NAN,
            y: 0.0
        }
        .is_valid());
        assert!(!MutationEvent::DesignUpdated { patch: "".into() }.is_valid());
    }

    #[test]
    fn test_locked_element() {
        assert_eq!(
            MutationEvent::FurnitureMoved {
                element_id: "sofa_1".into(),
                x: 0.0,
                y: 0.0
            }
            .locked_element(),
            Some(&"sofa_1".to_string())
        );
        assert_eq!(
            MutationEvent::FurnitureRemoved { element_id: "sofa_1".into() }.locked_element(),
            Some(&"sofa_1".to_string())
        );
        assert!(MutationEvent::FurnitureAdded { item: sofa() }
            .locked_element()
            .is_none());
        assert!(MutationEvent::DesignUpdated { patch: "{}".into() }
            .locked_element()
            .is_none());
    }

    #[test]
    fn test_only_cursor_is_ephemeral() {
        assert!(ServerFrame::CursorMoved {
            user_id: Uuid::new_v4(),
            x: 0.0,
            y: 0.0
        }
        .is_ephemeral());
        assert!(!ServerFrame::ElementUnlocked { element_id: "sofa_1".into() }.is_ephemeral());
        assert!(!ServerFrame::Busy.is_ephemeral());
    }

    #[test]
    fn test_cursor_position_validity() {
        assert!(CursorPosition::new(1.0, -3.5).is_valid());
        assert!(!CursorPosition::new(f32::INFINITY, 0.0).is_valid());
        assert!(!CursorPosition::new(0.0, f32::NAN).is_valid());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(ServerFrame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ClientFrame::decode(&[0xFF]).is_err());
    }

    #[test]
    fn test_cursor_frame_is_compact() {
        let frame = ServerFrame::CursorMoved {
            user_id: Uuid::new_v4(),
            x: 100.0,
            y: 200.0,
        };
        let encoded = frame.encode().unwrap();
        assert!(
            encoded.len() < 40,
            "cursor frame should be <40 bytes on wire, got {}",
            encoded.len()
        );
    }
}
