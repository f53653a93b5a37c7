//! Session identity and sync payload types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{ChangeSet, Scope};

/// Opaque identifier handed to a caller at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wrap an id received from a caller.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A registered caller. Sessions live in memory only.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    /// Last registration, sync, or attributed write
    pub last_seen_at: DateTime<Utc>,
    /// Per-scope sync watermark; scopes never synced start at `started_at`
    pub watermarks: HashMap<Scope, DateTime<Utc>>,
}

impl Session {
    pub fn new(session_id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            started_at: now,
            last_seen_at: now,
            watermarks: HashMap::new(),
        }
    }

    /// Timestamp up to which this session has received changes for `scope`.
    pub fn watermark(&self, scope: &Scope) -> DateTime<Utc> {
        self.watermarks.get(scope).copied().unwrap_or(self.started_at)
    }
}

/// Result of a sync call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub scope: Scope,
    /// Watermark the diff was computed against
    pub since_watermark: DateTime<Utc>,
    /// Watermark after this call; the next sync starts here
    pub watermark: DateTime<Utc>,
    pub changes: ChangeSet,
}

impl SyncResponse {
    pub fn total_changes(&self) -> usize {
        self.changes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_session_id_serializes_as_string() {
        let id = SessionId::from("abc123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc123\"");
    }

    #[test]
    fn test_watermark_defaults_to_start() {
        let now = Utc::now();
        let mut session = Session::new(SessionId::new(), now);
        let project = Scope::Project("/work/app".into());
        assert_eq!(session.watermark(&Scope::User), now);

        session.watermarks.insert(project.clone(), now + Duration::seconds(5));
        assert_eq!(session.watermark(&project), now + Duration::seconds(5));
        assert_eq!(session.watermark(&Scope::User), now);
    }
}
