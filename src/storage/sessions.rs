//! Authoritative session table
//!
//! Completed and historical sessions live here as JSON records keyed
//! `sessions/{user_id}/{session_id}`, so one user's history is a single
//! prefix scan away.

use std::sync::Arc;
use tracing::warn;

use super::kv::{RecordStore, StoreError};
use crate::session::{RunSession, SessionId, UserId};

#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn RecordStore>,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    fn key(user_id: UserId, session_id: SessionId) -> String {
        format!("sessions/{user_id}/{session_id}")
    }

    pub async fn save(&self, session: &RunSession) -> Result<(), StoreError> {
        let key = Self::key(session.user_id, session.id);
        let payload = serde_json::to_vec_pretty(session).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.put(&key, &payload).await
    }

    pub async fn load(
        &self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<Option<RunSession>, StoreError> {
        let key = Self::key(user_id, session_id);
        match self.store.get(&key).await? {
            Some(bytes) => {
                let session =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                        key,
                        reason: e.to_string(),
                    })?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// All of a user's sessions, oldest first. Unreadable records are
    /// skipped with a warning rather than failing the whole listing.
    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<RunSession>, StoreError> {
        let keys = self.store.list(&format!("sessions/{user_id}")).await?;
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<RunSession>(&bytes) {
                Ok(session) => sessions.push(session),
                Err(error) => warn!(key, %error, "skipping unreadable session record"),
            }
        }
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }

    /// Explicit user-initiated delete; samples are stored inline, so the
    /// cascade is implicit.
    pub async fn delete(
        &self,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<bool, StoreError> {
        self.store.delete(&Self::key(user_id, session_id)).await
    }
}
