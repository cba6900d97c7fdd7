//! Registry of attack sessions keyed by session id
//!
//! A host embedding the engine typically juggles several captured
//! connections at once, one session per connection. The registry hands
//! out shared handles and offers a halt-everything sweep for shutdown.

use crate::error::AttackResult;
use crate::session::AttackSession;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Concurrent map of live attack sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<AttackSession>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Add a session, returning its id
    pub fn register(&self, session: Arc<AttackSession>) -> Uuid {
        let id = session.id();
        self.sessions.insert(id, session);
        info!("registered attack session {}", id);
        id
    }

    /// Look up a session by id
    pub fn get(&self, id: &Uuid) -> Option<Arc<AttackSession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a session, returning it if present
    ///
    /// The caller is responsible for halting a running session first;
    /// dropping the returned handle cancels its workers either way.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<AttackSession>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            info!("removed attack session {}", id);
        }
        removed
    }

    /// All registered sessions
    pub fn list(&self) -> Vec<Arc<AttackSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no sessions are registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Halt every running session, returning how many were halted
    pub async fn halt_all(&self) -> AttackResult<usize> {
        let mut halted = 0;
        for session in self.list() {
            if !session.is_running() {
                continue;
            }
            match session.halt().await {
                Ok(()) => halted += 1,
                Err(err) => warn!("failed to halt attack session {}: {}", session.id(), err),
            }
        }
        if halted > 0 {
            info!("halted {} attack sessions", halted);
        }
        Ok(halted)
    }
}
