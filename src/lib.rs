//! # roomplan-collab — Real-time collaboration engine for shared room designs
//!
//! Lets multiple users edit one spatial design document (a room layout of
//! furniture items) concurrently, with live cursors, advisory element
//! locks, sequenced design mutations, and session chat.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket     ┌──────────────┐
//! │ CollabClient │ ◄──────────────► │ CollabServer │
//! │ (per user)   │   Binary Proto   │  (gateway)   │
//! └──────┬───────┘                  └──────┬───────┘
//!        │                                 │
//!        ▼                                 ▼
//! ┌──────────────┐                  ┌──────────────┐
//! │ Local        │                  │ Session      │
//! │ Reconciler   │                  │ Registry     │
//! └──────────────┘                  └──────┬───────┘
//!                                          │ one actor per project
//!                                   ┌──────┴───────┐
//!                                   │ SessionActor │
//!                                   │ presence ·   │
//!                                   │ locks · chat │
//!                                   └──────┬───────┘
//!                                   ┌──────┴───────┐
//!                                   │ Broadcaster  │
//!                                   │ (fan-out)    │
//!                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded frames)
//! - [`session`] — per-project actor: the serialization point for all
//!   session state
//! - [`locks`] — advisory, TTL-bounded element locks
//! - [`presence`] — participant table (liveness, cursors, selections)
//! - [`chat`] — append-only session chat log
//! - [`broadcast`] — per-peer outbound queues with backpressure
//! - [`registry`] — project id → running session actor
//! - [`server`] — WebSocket gateway and accept loop
//! - [`client`] — client gateway with bounded reconnection
//! - [`reconcile`] — client-side view with echo suppression
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Total event order per session | single actor task assigns sequences |
//! | One lock holder per element | actor-owned lock table, TTL-bounded |
//! | Slow peers never stall a session | bounded per-peer queues |
//! | Cursor traffic never queues up | ephemeral frames dropped first |

pub mod broadcast;
pub mod chat;
pub mod client;
pub mod locks;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, Broadcaster, PeerQueue};
pub use client::{
    ClientConfig, ClientError, ClientEvent, ClientStatus, CollabClient, ConnectionState,
};
pub use locks::{ElementLock, LockOutcome, LockTable};
pub use presence::{Participant, ParticipantTable};
pub use protocol::{
    ChatMessage, ClientFrame, CursorPosition, ElementId, FurnitureItem, LockInfo, MutationEvent,
    ParticipantInfo, ProtocolError, ServerFrame, SessionSnapshot,
};
pub use reconcile::{Applied, LocalReconciler};
pub use registry::SessionRegistry;
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use session::{
    spawn_session, SessionCommand, SessionConfig, SessionError, SessionHandle,
};
