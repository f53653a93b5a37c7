//! In-memory registry of active sessions.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use super::types::{Session, SessionId};
use crate::error::{Error, Result};

/// Registry of callers participating in diff-based sync.
///
/// Guarded by a short-held mutex that is never held across an await and is
/// always taken after (never before) a graph lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sessions<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut HashMap<SessionId, Session>) -> T,
    {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock session registry: {}", e)))?;
        Ok(f(&mut sessions))
    }

    /// Register a new session starting at `now`.
    pub fn register(&self, now: DateTime<Utc>) -> Result<SessionId> {
        let id = SessionId::new();
        self.with_sessions(|sessions| {
            sessions.insert(id.clone(), Session::new(id.clone(), now));
        })?;
        info!(session = %id, "session registered");
        Ok(id)
    }

    /// Run `f` against a registered session.
    pub fn with_session<F, T>(&self, id: &SessionId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> T,
    {
        self.with_sessions(|sessions| sessions.get_mut(id).map(f))?
            .ok_or_else(|| Error::UnknownSession(id.to_string()))
    }

    /// Refresh a session's activity time. Unknown ids are ignored.
    pub fn touch(&self, id: &SessionId, now: DateTime<Utc>) -> Result<bool> {
        self.with_sessions(|sessions| match sessions.get_mut(id) {
            Some(session) => {
                session.last_seen_at = session.last_seen_at.max(now);
                true
            }
            None => false,
        })
    }

    /// Number of registered sessions.
    pub fn active_count(&self) -> Result<usize> {
        self.with_sessions(|sessions| sessions.len())
    }

    #[cfg(test)]
    fn get(&self, id: &SessionId) -> Result<Option<Session>> {
        self.with_sessions(|sessions| sessions.get(id).cloned())
    }

    #[cfg(test)]
    fn contains(&self, id: &SessionId) -> Result<bool> {
        self.with_sessions(|sessions| sessions.contains_key(id))
    }

    /// Remove sessions idle for longer than `ttl`. Returns the purged ids.
    pub fn purge_idle(&self, now: DateTime<Utc>, ttl: Duration) -> Result<Vec<SessionId>> {
        let purged = self.with_sessions(|sessions| {
            let expired: Vec<SessionId> = sessions
                .values()
                .filter(|s| now - s.last_seen_at > ttl)
                .map(|s| s.session_id.clone())
                .collect();
            for id in &expired {
                sessions.remove(id);
            }
            expired
        })?;
        for id in &purged {
            info!(session = %id, "session expired and removed");
        }
        Ok(purged)
    }
}
