//! Client-side reconciliation of the local design view.
//!
//! The rendering layer applies a user's own edits optimistically through
//! [`LocalReconciler::apply_local`], then feeds every inbound
//! [`ClientEvent`] through [`LocalReconciler::handle_event`]. Echoes of
//! locally-originated mutations are suppressed by origin id — never by
//! content comparison — so an optimistic edit is not applied twice.
//! Remote mutations apply in sequence order; duplicates and regressions
//! are ignored.

use std::collections::HashMap;
use uuid::Uuid;

use crate::client::ClientEvent;
use crate::protocol::{CursorPosition, ElementId, FurnitureItem, MutationEvent};

/// What happened to a remote mutation offered to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Applied to the local view.
    Applied,
    /// Our own edit coming back; the optimistic apply already covered it.
    SuppressedEcho,
    /// Sequence at or below the last applied one.
    StaleDuplicate,
}

/// Local mirror of one session's design state plus remote presence.
pub struct LocalReconciler {
    local_user: Uuid,
    elements: HashMap<ElementId, FurnitureItem>,
    last_sequence: u64,
    /// Last document-level patch seen, opaque to the engine.
    last_patch: Option<String>,
    remote_cursors: HashMap<Uuid, CursorPosition>,
    lock_holders: HashMap<ElementId, Uuid>,
}

impl LocalReconciler {
    pub fn new(local_user: Uuid) -> Self {
        Self::with_elements(local_user, Vec::new())
    }

    /// Seed with the current room layout from the design layer; the
    /// engine's join sync carries presence and locks, not the layout.
    pub fn with_elements(local_user: Uuid, elements: Vec<FurnitureItem>) -> Self {
        Self {
            local_user,
            elements: elements
                .into_iter()
                .map(|item| (item.element_id.clone(), item))
                .collect(),
            last_sequence: 0,
            last_patch: None,
            remote_cursors: HashMap::new(),
            lock_holders: HashMap::new(),
        }
    }

    /// Optimistic apply of a local intent, before the server confirms.
    pub fn apply_local(&mut self, event: &MutationEvent) {
        self.apply(event);
    }

    /// Apply a broadcast mutation. Local echoes and stale sequences are
    /// ignored.
    pub fn apply_remote(&mut self, sequence: u64, origin: Uuid, event: &MutationEvent) -> Applied {
        if origin == self.local_user {
            return Applied::SuppressedEcho;
        }
        if sequence <= self.last_sequence {
            return Applied::StaleDuplicate;
        }
        self.last_sequence = sequence;
        self.apply(event);
        Applied::Applied
    }

    fn apply(&mut self, event: &MutationEvent) {
        match event {
            MutationEvent::FurnitureAdded { item } => {
                self.elements.insert(item.element_id.clone(), item.clone());
            }
            MutationEvent::FurnitureMoved { element_id, x, y } => {
                if let Some(item) = self.elements.get_mut(element_id) {
                    item.x = *x;
                    item.y = *y;
                }
            }
            MutationEvent::FurnitureRemoved { element_id } => {
                self.elements.remove(element_id);
            }
            MutationEvent::DesignUpdated { patch } => {
                self.last_patch = Some(patch.clone());
            }
        }
    }

    /// Route any client event into the view: mutations reconcile, presence
    /// and lock events update the remote bookkeeping, a (re)connect resets
    /// the sequence tracking against the fresh session.
    pub fn handle_event(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::Connected { snapshot } => {
                // Fresh session, fresh sequence space.
                self.last_sequence = 0;
                self.lock_holders = snapshot
                    .locks
                    .iter()
                    .map(|l| (l.element_id.clone(), l.holder))
                    .collect();
                self.remote_cursors = snapshot
                    .participants
                    .iter()
                    .filter(|p| p.user_id != self.local_user)
                    .filter_map(|p| p.cursor.map(|c| (p.user_id, c)))
                    .collect();
            }
            ClientEvent::Mutation {
                sequence,
                origin,
                event,
            } => {
                self.apply_remote(*sequence, *origin, event);
            }
            ClientEvent::CursorMoved { user_id, x, y } => {
                if *user_id != self.local_user {
                    self.remote_cursors
                        .insert(*user_id, CursorPosition::new(*x, *y));
                }
            }
            ClientEvent::UserLeft { user_id } => {
                self.remote_cursors.remove(user_id);
                self.lock_holders.retain(|_, holder| holder != user_id);
            }
            ClientEvent::ElementLocked {
                element_id,
                user_id,
            } => {
                self.lock_holders.insert(element_id.clone(), *user_id);
            }
            ClientEvent::ElementUnlocked { element_id } => {
                self.lock_holders.remove(element_id);
            }
            _ => {}
        }
    }

    pub fn element(&self, element_id: &str) -> Option<&FurnitureItem> {
        self.elements.get(element_id)
    }

    pub fn elements(&self) -> &HashMap<ElementId, FurnitureItem> {
        &self.elements
    }

    pub fn remote_cursor(&self, user_id: &Uuid) -> Option<CursorPosition> {
        self.remote_cursors.get(user_id).copied()
    }

    pub fn lock_holder(&self, element_id: &str) -> Option<Uuid> {
        self.lock_holders.get(element_id).copied()
    }

    /// True when someone other than the local user holds the element —
    /// the UI greys out the element's handles in that case.
    pub fn is_locked_by_other(&self, element_id: &str) -> bool {
        self.lock_holders
            .get(element_id)
            .map(|holder| *holder != self.local_user)
            .unwrap_or(false)
    }

    pub fn last_patch(&self) -> Option<&str> {
        self.last_patch.as_deref()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}
