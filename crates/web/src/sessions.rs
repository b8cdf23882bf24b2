//! Live-session index
//!
//! Process-wide bookkeeping of sessions currently being proxied. It is read
//! for introspection only and never consulted when routing a session.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;
use uuid::Uuid;
use vncdesk_common::now_epoch_secs;

/// Snapshot of one live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub token: String,
    pub origin: Option<String>,
    pub started_at: i64,
}

struct SessionEntry {
    info: SessionInfo,
    cancel: CancellationToken,
}

/// Concurrent index of live sessions, keyed by session id
#[derive(Clone, Default)]
pub struct LiveSessions {
    entries: Arc<DashMap<String, SessionEntry>>,
    shutdown: CancellationToken,
}

impl LiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session and return the guard that removes it again.
    pub fn register(&self, token: &str, origin: Option<&str>) -> SessionGuard {
        let session_id = Uuid::new_v4().to_string();
        let cancel = self.shutdown.child_token();
        self.entries.insert(
            session_id.clone(),
            SessionEntry {
                info: SessionInfo {
                    session_id: session_id.clone(),
                    token: token.to_string(),
                    origin: origin.map(String::from),
                    started_at: now_epoch_secs(),
                },
                cancel: cancel.clone(),
            },
        );
        debug!("Session {} registered for {}", session_id, token);

        SessionGuard {
            session_id,
            sessions: self.clone(),
            cancel,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_token(&self, token: &str) -> bool {
        self.entries.iter().any(|e| e.value().info.token == token)
    }

    /// Tokens of all live sessions, sorted
    pub fn tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.value().info.token.clone())
            .collect();
        tokens.sort();
        tokens
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.entries.iter().map(|e| e.value().info.clone()).collect();
        sessions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    /// Ask a live session to end. Returns false if it is not (or no longer) live.
    pub fn terminate(&self, session_id: &str) -> bool {
        match self.entries.get(session_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// End every live session and refuse to keep new ones open.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn remove(&self, session_id: &str) -> bool {
        self.entries.remove(session_id).is_some()
    }
}

/// Owns a session's index entry for the lifetime of the session
pub struct SessionGuard {
    session_id: String,
    sessions: LiveSessions,
    cancel: CancellationToken,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Resolves when the session has been terminated or the process is shutting down
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Remove the index entry. Safe to call more than once.
    pub fn release(&self) -> bool {
        let removed = self.sessions.remove(&self.session_id);
        if removed {
            debug!("Session {} released", self.session_id);
        }
        removed
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_removes_on_drop() {
        let sessions = LiveSessions::new();
        let guard = sessions.register("tok-a", Some("10.0.0.9"));
        assert_eq!(sessions.len(), 1);
        assert!(sessions.contains_token("tok-a"));
        assert_eq!(sessions.snapshot()[0].origin.as_deref(), Some("10.0.0.9"));

        drop(guard);
        assert!(sessions.is_empty());
        assert!(!sessions.contains_token("tok-a"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let sessions = LiveSessions::new();
        let guard = sessions.register("tok-a", None);
        let other = sessions.register("tok-b", None);

        assert!(guard.release());
        assert!(!guard.release());
        drop(guard);

        assert_eq!(sessions.tokens(), vec!["tok-b".to_string()]);
        drop(other);
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_same_token_sessions_are_independent() {
        let sessions = LiveSessions::new();
        let a = sessions.register("tok", None);
        let b = sessions.register("tok", None);
        assert_eq!(sessions.len(), 2);
        drop(a);
        assert!(sessions.contains_token("tok"));
        drop(b);
        assert!(!sessions.contains_token("tok"));
    }

    #[test]
    fn test_terminate_and_shutdown_cancel() {
        let sessions = LiveSessions::new();
        let a = sessions.register("a", None);
        let b = sessions.register("b", None);

        assert!(sessions.terminate(a.session_id()));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!sessions.terminate("unknown"));

        sessions.shutdown();
        assert!(b.is_cancelled());
        let late = sessions.register("c", None);
        assert!(late.is_cancelled());
    }

    #[tokio::test]
    async fn test_concurrent_register_and_release() {
        let sessions = LiveSessions::new();
        let mut handles = Vec::new();
        for i in 0..32 {
            let sessions = sessions.clone();
            handles.push(tokio::spawn(async move {
                let guard = sessions.register(&format!("tok-{}", i), None);
                tokio::task::yield_now().await;
                drop(guard);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(sessions.is_empty());
    }
}
