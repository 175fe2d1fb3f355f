//! Participant table: identity, liveness, cursor, and selection per user.
//!
//! Owned by the session actor. Mutators are `join` / `set_inactive` /
//! `set_cursor` / `set_selection`; reads never contend with writes because
//! the single-actor model serializes everything structurally.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{CursorPosition, ElementId, ParticipantInfo};

/// One connected (or recently disconnected) user in a session.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: Uuid,
    pub username: String,
    pub is_active: bool,
    pub cursor: Option<CursorPosition>,
    pub selected_elements: HashSet<ElementId>,
    pub joined_at: Instant,
    /// Set while `is_active == false`; drives grace-period retirement.
    pub inactive_since: Option<Instant>,
}

impl Participant {
    pub fn info(&self) -> ParticipantInfo {
        let mut selected: Vec<ElementId> = self.selected_elements.iter().cloned().collect();
        selected.sort();
        ParticipantInfo {
            user_id: self.user_id,
            username: self.username.clone(),
            is_active: self.is_active,
            cursor: self.cursor,
            selected_elements: selected,
        }
    }
}

/// The presence tracker for one session.
#[derive(Default)]
pub struct ParticipantTable {
    participants: HashMap<Uuid, Participant>,
}

impl ParticipantTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant. Rejoining with a known `user_id` reactivates
    /// the existing entry instead of duplicating it; returns `true` for
    /// that reactivation case.
    pub fn join(&mut self, user_id: Uuid, username: String, now: Instant) -> bool {
        match self.participants.get_mut(&user_id) {
            Some(existing) => {
                existing.is_active = true;
                existing.inactive_since = None;
                existing.username = username;
                true
            }
            None => {
                self.participants.insert(
                    user_id,
                    Participant {
                        user_id,
                        username,
                        is_active: true,
                        cursor: None,
                        selected_elements: HashSet::new(),
                        joined_at: now,
                        inactive_since: None,
                    },
                );
                false
            }
        }
    }

    /// Flip a participant inactive (transport dropped). Removal happens
    /// later, in `retire_inactive`, unless the user rejoins first.
    pub fn set_inactive(&mut self, user_id: Uuid, now: Instant) -> bool {
        match self.participants.get_mut(&user_id) {
            Some(p) if p.is_active => {
                p.is_active = false;
                p.inactive_since = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Remove immediately (explicit leave).
    pub fn remove(&mut self, user_id: Uuid) -> bool {
        self.participants.remove(&user_id).is_some()
    }

    pub fn set_cursor(&mut self, user_id: Uuid, cursor: CursorPosition) -> bool {
        match self.participants.get_mut(&user_id) {
            Some(p) => {
                p.cursor = Some(cursor);
                true
            }
            None => false,
        }
    }

    pub fn set_selection(&mut self, user_id: Uuid, element_ids: Vec<ElementId>) -> bool {
        match self.participants.get_mut(&user_id) {
            Some(p) => {
                p.selected_elements = element_ids.into_iter().collect();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, user_id: &Uuid) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.participants.contains_key(user_id)
    }

    pub fn is_active(&self, user_id: &Uuid) -> bool {
        self.participants
            .get(user_id)
            .map(|p| p.is_active)
            .unwrap_or(false)
    }

    /// Remove participants that have been inactive longer than `grace`,
    /// returning the retired user ids.
    pub fn retire_inactive(&mut self, now: Instant, grace: Duration) -> Vec<Uuid> {
        let retired: Vec<Uuid> = self
            .participants
            .values()
            .filter(|p| {
                !p.is_active
                    && p.inactive_since
                        .map(|t| now.duration_since(t) >= grace)
                        .unwrap_or(false)
            })
            .map(|p| p.user_id)
            .collect();
        for id in &retired {
            self.participants.remove(id);
        }
        retired
    }

    pub fn snapshot(&self) -> Vec<ParticipantInfo> {
        let mut infos: Vec<ParticipantInfo> =
            self.participants.values().map(Participant::info).collect();
        infos.sort_by_key(|p| p.user_id);
        infos
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.participants.values().filter(|p| p.is_active).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_snapshot() {
        let mut t = ParticipantTable::new();
        let now = Instant::now();
        let alice = Uuid::new_v4();

        assert!(!t.join(alice, "Alice".into(), now));
        assert_eq!(t.len(), 1);
        let snap = t.snapshot();
        assert_eq!(snap[0].username, "Alice");
        assert!(snap[0].is_active);
    }

    #[test]
    fn test_rejoin_reactivates_without_duplicate() {
        let mut t = ParticipantTable::new();
        let now = Instant::now();
        let alice = Uuid::new_v4();

        t.join(alice, "Alice".into(), now);
        t.set_inactive(alice, now);
        assert!(!t.is_active(&alice));

        assert!(t.join(alice, "Alice".into(), now + Duration::from_secs(1)));
        assert_eq!(t.len(), 1);
        assert!(t.is_active(&alice));
        assert!(t.get(&alice).unwrap().inactive_since.is_none());
    }

    #[test]
    fn test_retire_inactive_after_grace() {
        let mut t = ParticipantTable::new();
        let now = Instant::now();
        let grace = Duration::from_secs(30);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        t.join(alice, "Alice".into(), now);
        t.join(bob, "Bob".into(), now);
        t.set_inactive(alice, now);

        // Before grace elapses: nobody retired.
        assert!(t.retire_inactive(now + Duration::from_secs(10), grace).is_empty());
        assert_eq!(t.len(), 2);

        // After: only the inactive participant goes.
        let retired = t.retire_inactive(now + Duration::from_secs(31), grace);
        assert_eq!(retired, vec![alice]);
        assert_eq!(t.len(), 1);
        assert!(t.contains(&bob));
    }

    #[test]
    fn test_cursor_and_selection_updates() {
        let mut t = ParticipantTable::new();
        let now = Instant::now();
        let alice = Uuid::new_v4();

        t.join(alice, "Alice".into(), now);
        assert!(t.set_cursor(alice, CursorPosition::new(3.0, 4.0)));
        assert!(t.set_selection(alice, vec!["sofa_1".into(), "lamp_2".into()]));

        let p = t.get(&alice).unwrap();
        assert_eq!(p.cursor, Some(CursorPosition::new(3.0, 4.0)));
        assert_eq!(p.selected_elements.len(), 2);

        // Overwrite semantics, not append.
        assert!(t.set_cursor(alice, CursorPosition::new(5.0, 6.0)));
        assert_eq!(t.get(&alice).unwrap().cursor, Some(CursorPosition::new(5.0, 6.0)));
    }

    #[test]
    fn test_updates_for_unknown_user_are_noops() {
        let mut t = ParticipantTable::new();
        let ghost = Uuid::new_v4();
        assert!(!t.set_cursor(ghost, CursorPosition::new(0.0, 0.0)));
        assert!(!t.set_selection(ghost, vec![]));
        assert!(!t.set_inactive(ghost, Instant::now()));
        assert!(!t.remove(ghost));
    }

    #[test]
    fn test_active_count_ignores_inactive() {
        let mut t = ParticipantTable::new();
        let now = Instant::now();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        t.join(alice, "Alice".into(), now);
        t.join(bob, "Bob".into(), now);
        t.set_inactive(bob, now);

        assert_eq!(t.active_count(), 1);
        assert_eq!(t.len(), 2);
    }
}
