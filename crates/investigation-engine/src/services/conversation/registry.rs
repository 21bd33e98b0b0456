use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::types::SessionState;
use crate::models::SessionId;

/// One live session. The mutex is the per-session writer lock.
pub struct SessionHandle {
    pub id: SessionId,
    pub state: Mutex<SessionState>,
}

/// Live sessions keyed by id. Owned by whoever builds the controller.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        info!("Initializing session registry with DashMap");
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Insert or replace the session and return its handle.
    pub fn insert(&self, state: SessionState) -> Arc<SessionHandle> {
        let id = state.session.id.clone();
        let handle = Arc::new(SessionHandle {
            id: id.clone(),
            state: Mutex::new(state),
        });
        if self.sessions.insert(id.clone(), Arc::clone(&handle)).is_some() {
            debug!("Replaced session {} in registry", id);
        }
        handle
    }

    /// Clone of the handle; the map shard lock is released on return.
    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(session_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(session_id).map(|(_, handle)| handle)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
