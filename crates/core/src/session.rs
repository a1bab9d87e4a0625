use crate::conversation::SessionState;
use crate::models::SessionOptions;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Shared handle to one session; hold the lock for a whole question cycle.
pub type SessionHandle = Arc<AsyncMutex<SessionState>>;

struct SessionSlot {
    handle: SessionHandle,
    last_seen: Instant,
}

/// Bounded, expiring map from session id to its conversation state.
///
/// Least-recently-used sessions are evicted once `capacity` is reached, and a
/// session untouched for longer than `ttl` is replaced by a fresh one on next use.
pub struct SessionManager {
    sessions: Mutex<LruCache<String, SessionSlot>>,
    ttl: Duration,
    history_capacity: usize,
}

impl SessionManager {
    pub fn new(options: SessionOptions, history_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(options.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: Mutex::new(LruCache::new(capacity)),
            ttl: options.ttl,
            history_capacity,
        }
    }

    /// Returns the session for `session_id`, creating it when absent or expired.
    pub fn handle(&self, session_id: &str) -> SessionHandle {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if let Some(slot) = sessions.get_mut(session_id) {
            if now.duration_since(slot.last_seen) <= self.ttl {
                slot.last_seen = now;
                return slot.handle.clone();
            }
            debug!(session = session_id, "session expired, starting over");
        }

        let handle = Arc::new(AsyncMutex::new(SessionState::new(
            session_id,
            self.history_capacity,
        )));
        if let Some((evicted, _)) = sessions.push(
            session_id.to_string(),
            SessionSlot {
                handle: handle.clone(),
                last_seen: now,
            },
        ) {
            if evicted != session_id {
                debug!(session = %evicted, "session evicted");
            }
        }
        handle
    }

    pub fn create_session(&self) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.handle(&session_id);
        info!(session = %session_id, "session created");
        session_id
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(session_id)
    }

    /// Drops every session idle for longer than the TTL.
    pub fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.last_seen) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.pop(id);
        }

        if !expired.is_empty() {
            debug!(purged = expired.len(), "expired sessions removed");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::SubjectState;

    fn manager(capacity: usize, ttl: Duration) -> SessionManager {
        SessionManager::new(SessionOptions { capacity, ttl }, 10)
    }

    #[tokio::test]
    async fn same_id_shares_state() {
        let sessions = manager(4, Duration::from_secs(60));
        {
            let handle = sessions.handle("a");
            let mut state = handle.lock().await;
            state.set_subject(SubjectState::activate("Jane Tan"));
            state.record("Does Jane Tan smoke?", "No.");
        }

        let handle = sessions.handle("a");
        let state = handle.lock().await;
        assert_eq!(state.active_subject(), Some("Jane Tan"));
        assert_eq!(state.history().len(), 2);
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let sessions = manager(4, Duration::from_secs(60));
        sessions
            .handle("a")
            .lock()
            .await
            .set_subject(SubjectState::activate("Jane Tan"));

        let other = sessions.handle("b");
        assert_eq!(other.lock().await.active_subject(), None);
    }

    #[test]
    fn least_recently_used_session_is_evicted() {
        let sessions = manager(2, Duration::from_secs(60));
        sessions.handle("a");
        sessions.handle("b");
        sessions.handle("a");
        sessions.handle("c");

        assert!(sessions.contains("a"));
        assert!(!sessions.contains("b"));
        assert!(sessions.contains("c"));
    }

    #[tokio::test]
    async fn expired_sessions_start_fresh_and_are_purged() {
        let sessions = manager(4, Duration::ZERO);
        sessions
            .handle("a")
            .lock()
            .await
            .set_subject(SubjectState::activate("Jane Tan"));
        std::thread::sleep(Duration::from_millis(5));

        let fresh = sessions.handle("a");
        assert_eq!(fresh.lock().await.active_subject(), None);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(sessions.purge_expired(), 1);
        assert!(sessions.is_empty());
    }

    #[test]
    fn created_sessions_get_unique_ids() {
        let sessions = manager(4, Duration::from_secs(60));
        let first = sessions.create_session();
        let second = sessions.create_session();

        assert_ne!(first, second);
        assert!(sessions.contains(&first));
        assert_eq!(sessions.len(), 2);
    }
}
