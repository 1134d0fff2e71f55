use dashmap::DashMap;
use std::sync::Arc;

use crate::session::Session;

/// Live sessions of an endpoint, keyed by session id.
#[derive(Default)]
pub(crate) struct Hub {
    sessions: DashMap<String, Arc<Session>>,
}

impl Hub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Removes the entry for `session` only if it is still the one stored
    /// under its id.
    pub(crate) fn remove(&self, session: &Arc<Session>) {
        self.sessions
            .remove_if(&session.id(), |_, stored| Arc::ptr_eq(stored, session));
    }

    pub(crate) fn rekey(&self, old_id: &str, session: &Arc<Session>) {
        let removed = self
            .sessions
            .remove_if(old_id, |_, stored| Arc::ptr_eq(stored, session))
            .is_some();
        if removed {
            self.sessions.insert(session.id(), session.clone());
        }
    }

    /// Visits sessions until `f` returns false.
    pub(crate) fn range<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Session>) -> bool,
    {
        // Collect first so `f` may touch the hub without deadlocking a shard.
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in &sessions {
            if !f(session) {
                break;
            }
        }
    }

    pub(crate) fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
