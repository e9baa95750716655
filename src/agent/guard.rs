//! Exactly-once session cleanup.

use std::sync::Arc;

use crate::error::CleanupError;
use crate::session::{Session, SessionStore};

/// Owns a live session and deletes it once.
///
/// Call [`SessionGuard::release`] on every normal exit path. If the guard is
/// dropped while still holding the session (an early `?` return), the
/// deletion is spawned on the current tokio runtime instead. That fallback
/// does not survive a runtime that is shutting down, so code that may panic
/// should run on a task of its own while a [`detach`](SessionGuard::detach)ed
/// guard waits outside it.
pub struct SessionGuard {
    store: Arc<dyn SessionStore>,
    session: Option<Session>,
}

impl SessionGuard {
    pub fn new(store: Arc<dyn SessionStore>, session: Session) -> Self {
        Self {
            store,
            session: Some(session),
        }
    }

    /// The guarded session, until it has been released.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Move the session into a new guard, leaving this one empty.
    pub fn detach(&mut self) -> SessionGuard {
        SessionGuard {
            store: self.store.clone(),
            session: self.session.take(),
        }
    }

    /// Delete the session. Later calls are no-ops.
    pub async fn release(&mut self) -> Result<(), CleanupError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        match self.store.delete_session(&session).await {
            Ok(()) => {
                tracing::info!(agent_id = %session.agent_id, "Deleted agent");
                Ok(())
            }
            Err(source) => Err(CleanupError {
                session_id: session.id,
                source,
            }),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move {
                    match store.delete_session(&session).await {
                        Ok(()) => tracing::info!(agent_id = %session.agent_id, "Deleted agent"),
                        Err(e) => tracing::warn!("Failed to delete session {}: {}", session.id, e),
                    }
                });
            }
            Err(_) => tracing::warn!(
                "Session {} dropped outside a runtime; agent {} was not deleted",
                session.id,
                session.agent_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AgentConfig, InMemorySessionStore};

    async fn guarded(store: &InMemorySessionStore) -> SessionGuard {
        let session = store
            .create_session(&AgentConfig {
                model: "gpt-4o".to_string(),
                name: "test".to_string(),
                instructions: String::new(),
                temperature: 0.7,
                top_p: 0.7,
                tools: vec![],
                tool_resources: serde_json::json!({}),
            })
            .await
            .unwrap();
        SessionGuard::new(Arc::new(store.clone()), session)
    }

    #[tokio::test]
    async fn release_twice_deletes_once() {
        let store = InMemorySessionStore::new();
        let mut guard = guarded(&store).await;

        guard.release().await.unwrap();
        guard.release().await.unwrap();
        drop(guard);

        assert_eq!(store.delete_calls(), 1);
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn detached_guard_owns_the_deletion() {
        let store = InMemorySessionStore::new();
        let mut original = guarded(&store).await;

        let mut detached = original.detach();
        assert!(original.session().is_none());
        drop(original);
        tokio::task::yield_now().await;
        assert_eq!(store.delete_calls(), 0);

        detached.release().await.unwrap();
        assert_eq!(store.delete_calls(), 1);
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn dropping_unreleased_guard_still_cleans_up() {
        let store = InMemorySessionStore::new();
        let guard = guarded(&store).await;

        drop(guard);
        // Let the spawned cleanup run.
        for _ in 0..10 {
            if store.session_count().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(store.delete_calls(), 1);
        assert_eq!(store.session_count().await, 0);
    }
}
