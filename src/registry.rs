//! Process-wide map from project id to its running session actor.
//!
//! The one structure touched by many connection tasks concurrently.
//! Creation goes through a read-fast-path / double-checked write lock so
//! two racing joins can never spawn two actors for the same project.

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::session::{spawn_session, SessionConfig, SessionHandle};

pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Resolve the live session for a project, spawning one on first join.
    /// A handle whose actor tore itself down is replaced with a fresh
    /// session (empty chat history, per teardown semantics).
    pub async fn get_or_create(&self, project_id: Uuid) -> SessionHandle {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(&project_id) {
                if !handle.is_closed() {
                    return handle.clone();
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        // Re-check after acquiring the write lock.
        if let Some(handle) = sessions.get(&project_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let handle = spawn_session(project_id, self.config.clone());
        sessions.insert(project_id, handle.clone());
        log::info!("registered session for project {project_id}");
        handle
    }

    /// Lookup without creating.
    pub async fn get(&self, project_id: &Uuid) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions
            .get(project_id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Drop handles to torn-down actors; returns how many were removed.
    pub async fn prune(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, handle| !handle.is_closed());
        before - sessions.len()
    }

    /// Live sessions only.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.values().filter(|h| !h.is_closed()).count()
    }

    pub async fn active_projects(&self) -> Vec<Uuid> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }
}
