use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::ProtocolError;
use crate::inbound::InboundPipe;

/// Live sessions for one receiving role at an endpoint.
///
/// The map lock is never held while a pipe lock is taken.
pub struct SessionDirectory {
    name: &'static str,
    sessions: RwLock<HashMap<String, Arc<InboundPipe>>>,
}

impl SessionDirectory {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn register(&self, pipe: Arc<InboundPipe>) -> Result<(), ProtocolError> {
        let id = pipe.session_id().to_string();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&id) {
            return Err(ProtocolError::DuplicateSession { session: id });
        }
        sessions.insert(id, pipe);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<InboundPipe>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<InboundPipe>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if removed.is_some() {
            crate::logging::debug(format!(
                "directory {}: removed session={session_id}",
                self.name
            ));
        }
        removed
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
