//! Advisory element locks with TTL auto-release.
//!
//! State machine per element:
//! ```text
//! Unlocked ──Lock──► Locked(holder, expiry)
//!    ▲                    │
//!    └── Unlock / Expire / HolderDisconnected
//! ```
//!
//! A second `Lock` while held is a no-op returning `Denied(holder)`.
//! The table is owned by the session actor, so no internal locking —
//! serialization is structural.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{ElementId, LockInfo};

/// One granted lock.
#[derive(Debug, Clone)]
pub struct ElementLock {
    pub holder: Uuid,
    pub acquired_at: Instant,
    pub expires_at: Instant,
}

/// Outcome of a lock request. A denial is a normal result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Denied { holder: Uuid },
}

/// Lock table for one session. Expiry is evaluated lazily on access and
/// by the actor's periodic sweep.
pub struct LockTable {
    locks: HashMap<ElementId, ElementLock>,
    ttl: Duration,
}

impl LockTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            locks: HashMap::new(),
            ttl,
        }
    }

    /// Grant the lock if the element is unlocked (or its lock has expired).
    /// Re-locking by the current holder refreshes the TTL — the drag
    /// keep-alive path.
    pub fn try_lock(&mut self, element_id: &ElementId, user_id: Uuid, now: Instant) -> LockOutcome {
        match self.locks.get_mut(element_id) {
            Some(lock) if lock.expires_at > now => {
                if lock.holder == user_id {
                    lock.expires_at = now + self.ttl;
                    LockOutcome::Granted
                } else {
                    LockOutcome::Denied { holder: lock.holder }
                }
            }
            _ => {
                self.locks.insert(
                    element_id.clone(),
                    ElementLock {
                        holder: user_id,
                        acquired_at: now,
                        expires_at: now + self.ttl,
                    },
                );
                LockOutcome::Granted
            }
        }
    }

    /// Release only if `user_id` is the current holder; anything else is a
    /// no-op. Returns whether a lock was released.
    pub fn unlock(&mut self, element_id: &ElementId, user_id: Uuid) -> bool {
        match self.locks.get(element_id) {
            Some(lock) if lock.holder == user_id => {
                self.locks.remove(element_id);
                true
            }
            _ => false,
        }
    }

    /// Current holder of a live lock, if any.
    pub fn holder(&self, element_id: &ElementId, now: Instant) -> Option<Uuid> {
        self.locks
            .get(element_id)
            .filter(|lock| lock.expires_at > now)
            .map(|lock| lock.holder)
    }

    /// Refresh the TTL if `user_id` holds the element. Called when a
    /// holder mutates the element mid-drag.
    pub fn touch(&mut self, element_id: &ElementId, user_id: Uuid, now: Instant) {
        if let Some(lock) = self.locks.get_mut(element_id) {
            if lock.holder == user_id && lock.expires_at > now {
                lock.expires_at = now + self.ttl;
            }
        }
    }

    /// Drop all expired locks, returning the released element ids.
    pub fn release_expired(&mut self, now: Instant) -> Vec<ElementId> {
        let expired: Vec<ElementId> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.locks.remove(id);
        }
        expired
    }

    /// Drop every lock held by `user_id` (holder disconnected), returning
    /// the released element ids.
    pub fn release_held_by(&mut self, user_id: Uuid) -> Vec<ElementId> {
        let held: Vec<ElementId> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.holder == user_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &held {
            self.locks.remove(id);
        }
        held
    }

    /// Live locks for the `JoinAck` snapshot.
    pub fn snapshot(&self, now: Instant) -> Vec<LockInfo> {
        self.locks
            .iter()
            .filter(|(_, lock)| lock.expires_at > now)
            .map(|(id, lock)| LockInfo {
                element_id: id.clone(),
                holder: lock.holder,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
