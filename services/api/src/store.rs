//! In-memory session registry. Sessions live for the life of the process.

use chrono::{DateTime, Utc};
use omni_agent_core::{Session, SessionConfig};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// A session as the server tracks it.
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub session: Session,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, StoredSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session under a fresh id.
    pub async fn create(&self, config: SessionConfig) -> anyhow::Result<StoredSession> {
        let id = Uuid::new_v4().to_string();
        let stored = StoredSession {
            session: Session::new(id.clone(), config)?,
            created_at: Utc::now(),
        };
        self.sessions.write().await.insert(id.clone(), stored.clone());
        info!(session_id = %id, "Session created");
        Ok(stored)
    }

    pub async fn get(&self, id: &str) -> Option<StoredSession> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Closes and forgets a session. Returns `false` if it was not open.
    pub async fn close(&self, id: &str) -> bool {
        match self.sessions.write().await.remove(id) {
            Some(stored) => {
                stored.session.close();
                info!(session_id = %id, "Session closed");
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_get_close() {
        let store = SessionStore::new();
        let stored = store.create(SessionConfig::default()).await.unwrap();
        let id = stored.session.id().to_string();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(store.len().await, 1);

        let fetched = store.get(&id).await.unwrap();
        assert_eq!(fetched.session.config(), &SessionConfig::default());

        assert!(store.close(&id).await);
        assert!(!store.close(&id).await);
        assert!(store.get(&id).await.is_none());
        assert!(fetched.session.is_closed());
        assert!(store.is_empty().await);
    }
}
