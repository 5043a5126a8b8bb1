//! In-memory session registry.
//!
//! Maps a session id to its current (control channel id, media channel id)
//! pair plus reverse indices for O(1) resolution in both directions. A single
//! mutex guards the whole structure; every operation is O(1) map work.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use dx_domain::error::{Error, Result};

/// Default session TTL before the sweep evicts an idle session.
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

/// A single tracked session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub current_thread_id: Option<String>,
    pub control_id: Option<String>,
    pub media_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Ordered, deduplicated thread ids this session has visited.
    pub thread_history: Vec<String>,
}

impl SessionInfo {
    fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            current_thread_id: None,
            control_id: None,
            media_id: None,
            created_at: now,
            last_activity: now,
            thread_history: Vec::new(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    fn visit_thread(&mut self, thread_id: &str) {
        self.current_thread_id = Some(thread_id.to_string());
        if !self.thread_history.iter().any(|t| t == thread_id) {
            self.thread_history.push(thread_id.to_string());
        }
    }
}

/// Snapshot returned by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_control_bindings: usize,
    pub active_media_bindings: usize,
    pub sessions: Vec<SessionInfo>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionInfo>,
    control_index: HashMap<String, String>,
    media_index: HashMap<String, String>,
}

/// Registry coordinating control and media channels for the same session.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a control channel to a session, creating the session on first use.
    ///
    /// Idempotent in `(session_id, control_id)`. Binding a different control
    /// id evicts the previous binding and removes its reverse-index entry.
    pub fn bind_control(&self, session_id: &str, control_id: &str, thread_id: &str) {
        let mut inner = self.inner.lock();

        let session = inner
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::info!(session_id = %session_id, "session created");
                SessionInfo::new(session_id)
            });

        let previous = session.control_id.replace(control_id.to_string());
        session.visit_thread(thread_id);
        session.touch();

        if let Some(old) = previous.filter(|old| old != control_id) {
            inner.control_index.remove(&old);
            tracing::info!(
                session_id = %session_id,
                old_control = %old,
                new_control = %control_id,
                "control channel rebound"
            );
        }
        inner
            .control_index
            .insert(control_id.to_string(), session_id.to_string());

        tracing::debug!(
            session_id = %session_id,
            control_id = %control_id,
            thread_id = %thread_id,
            "control channel bound"
        );
    }

    /// Bind a media channel to an existing session.
    ///
    /// Fails with [`Error::SessionNotFound`] if the session has no control
    /// binding history (a media channel can never create a session). A thread
    /// mismatch updates the session's current thread rather than failing.
    pub fn bind_media(&self, session_id: &str, media_id: &str, thread_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();

        if !inner.sessions.contains_key(session_id) {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }

        let session = inner.sessions.get_mut(session_id).unwrap();
        if session
            .current_thread_id
            .as_deref()
            .is_some_and(|t| t != thread_id)
        {
            tracing::warn!(
                session_id = %session_id,
                session_thread = ?session.current_thread_id,
                media_thread = %thread_id,
                "thread mismatch on media bind, following the media thread"
            );
        }
        session.visit_thread(thread_id);
        session.touch();

        let previous = session.media_id.replace(media_id.to_string());
        if let Some(old) = previous.filter(|old| old != media_id) {
            inner.media_index.remove(&old);
            tracing::info!(
                session_id = %session_id,
                old_media = %old,
                new_media = %media_id,
                "media channel rebound"
            );
        }
        inner
            .media_index
            .insert(media_id.to_string(), session_id.to_string());

        tracing::debug!(
            session_id = %session_id,
            media_id = %media_id,
            thread_id = %thread_id,
            "media channel bound"
        );
        Ok(())
    }

    /// Remove a control binding. Returns true if the binding existed.
    pub fn unbind_control(&self, control_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(session_id) = inner.control_index.remove(control_id) else {
            return false;
        };
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            if session.control_id.as_deref() == Some(control_id) {
                session.control_id = None;
                session.touch();
                tracing::info!(
                    session_id = %session_id,
                    control_id = %control_id,
                    "control channel unbound"
                );
                return true;
            }
        }
        false
    }

    /// Remove a media binding. Returns true if the binding existed.
    pub fn unbind_media(&self, media_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(session_id) = inner.media_index.remove(media_id) else {
            return false;
        };
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            if session.media_id.as_deref() == Some(media_id) {
                session.media_id = None;
                session.touch();
                tracing::info!(
                    session_id = %session_id,
                    media_id = %media_id,
                    "media channel unbound"
                );
                return true;
            }
        }
        false
    }

    /// Session info for a session id.
    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    /// The control channel currently linked to a media channel.
    pub fn control_for_media(&self, media_id: &str) -> Option<String> {
        let inner = self.inner.lock();
        let session_id = inner.media_index.get(media_id)?;
        inner.sessions.get(session_id)?.control_id.clone()
    }

    /// The media channel currently linked to a control channel.
    pub fn media_for_control(&self, control_id: &str) -> Option<String> {
        let inner = self.inner.lock();
        let session_id = inner.control_index.get(control_id)?;
        inner.sessions.get(session_id)?.media_id.clone()
    }

    /// Both channel ids for a session.
    pub fn channels(&self, session_id: &str) -> (Option<String>, Option<String>) {
        let inner = self.inner.lock();
        match inner.sessions.get(session_id) {
            Some(s) => (s.control_id.clone(), s.media_id.clone()),
            None => (None, None),
        }
    }

    /// Evict sessions idle beyond `max_age_hours`. Returns the evicted count.
    pub fn sweep_stale(&self, max_age_hours: i64) -> usize {
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        let mut inner = self.inner.lock();

        let stale: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| s.last_activity < cutoff)
            .map(|s| s.session_id.clone())
            .collect();

        for session_id in &stale {
            if let Some(session) = inner.sessions.remove(session_id) {
                if let Some(control) = session.control_id {
                    inner.control_index.remove(&control);
                }
                if let Some(media) = session.media_id {
                    inner.media_index.remove(&media);
                }
                tracing::info!(session_id = %session_id, "stale session evicted");
            }
        }

        stale.len()
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.inner.lock();
        SessionStats {
            total_sessions: inner.sessions.len(),
            active_control_bindings: inner.control_index.len(),
            active_media_bindings: inner.media_index.len(),
            sessions: inner.sessions.values().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_bind_requires_existing_session() {
        let reg = SessionRegistry::new();
        let err = reg.bind_media("S", "R1", "T").unwrap_err();
        assert_eq!(err.code(), "session_not_found");
        // The failed bind must not have created the session.
        assert!(reg.get("S").is_none());
    }

    #[test]
    fn control_then_media_links_both_directions() {
        let reg = SessionRegistry::new();
        reg.bind_control("S", "W1", "T");
        reg.bind_media("S", "R1", "T").unwrap();

        assert_eq!(reg.control_for_media("R1").as_deref(), Some("W1"));
        assert_eq!(reg.media_for_control("W1").as_deref(), Some("R1"));
        assert_eq!(
            reg.channels("S"),
            (Some("W1".into()), Some("R1".into()))
        );
    }

    #[test]
    fn rebinding_same_pair_is_a_noop() {
        let reg = SessionRegistry::new();
        reg.bind_control("S", "W1", "T");
        reg.bind_control("S", "W1", "T");

        let info = reg.get("S").unwrap();
        assert_eq!(info.control_id.as_deref(), Some("W1"));
        assert_eq!(info.thread_history, vec!["T".to_string()]);
    }

    #[test]
    fn rebinding_new_control_evicts_old() {
        let reg = SessionRegistry::new();
        reg.bind_control("S", "W1", "T");
        reg.bind_media("S", "R1", "T").unwrap();

        reg.bind_control("S", "W2", "T");

        // Reverse index holds exactly the new id.
        assert_eq!(reg.control_for_media("R1").as_deref(), Some("W2"));
        assert_eq!(reg.media_for_control("W2").as_deref(), Some("R1"));
        assert_eq!(reg.media_for_control("W1"), None);
    }

    #[test]
    fn thread_mismatch_on_media_bind_updates_thread() {
        let reg = SessionRegistry::new();
        reg.bind_control("S", "W1", "T1");
        reg.bind_media("S", "R1", "T2").unwrap();

        let info = reg.get("S").unwrap();
        assert_eq!(info.current_thread_id.as_deref(), Some("T2"));
        assert_eq!(info.thread_history, vec!["T1".to_string(), "T2".to_string()]);
    }

    #[test]
    fn unbind_clears_slot_but_keeps_session() {
        let reg = SessionRegistry::new();
        reg.bind_control("S", "W1", "T");
        reg.bind_media("S", "R1", "T").unwrap();

        assert!(reg.unbind_media("R1"));
        assert!(!reg.unbind_media("R1"));
        assert!(reg.unbind_control("W1"));

        let info = reg.get("S").unwrap();
        assert!(info.control_id.is_none());
        assert!(info.media_id.is_none());
    }

    #[test]
    fn stale_unbind_does_not_clobber_new_binding() {
        let reg = SessionRegistry::new();
        reg.bind_control("S", "W1", "T");
        reg.bind_control("S", "W2", "T");

        // W1 was already evicted; unbinding it must not touch W2.
        assert!(!reg.unbind_control("W1"));
        assert_eq!(reg.get("S").unwrap().control_id.as_deref(), Some("W2"));
    }

    #[test]
    fn sweep_evicts_idle_sessions_and_indices() {
        let reg = SessionRegistry::new();
        reg.bind_control("S", "W1", "T");
        reg.bind_media("S", "R1", "T").unwrap();

        // Backdate the session past the TTL.
        {
            let mut inner = reg.inner.lock();
            inner.sessions.get_mut("S").unwrap().last_activity =
                Utc::now() - Duration::hours(25);
        }

        assert_eq!(reg.sweep_stale(DEFAULT_SESSION_TTL_HOURS), 1);
        assert!(reg.get("S").is_none());
        assert_eq!(reg.control_for_media("R1"), None);
        assert_eq!(reg.media_for_control("W1"), None);
    }

    #[test]
    fn sweep_keeps_active_sessions() {
        let reg = SessionRegistry::new();
        reg.bind_control("S", "W1", "T");
        assert_eq!(reg.sweep_stale(DEFAULT_SESSION_TTL_HOURS), 0);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn stats_counts_bindings() {
        let reg = SessionRegistry::new();
        reg.bind_control("A", "W1", "T");
        reg.bind_control("B", "W2", "T");
        reg.bind_media("A", "R1", "T").unwrap();

        let stats = reg.stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_control_bindings, 2);
        assert_eq!(stats.active_media_bindings, 1);
    }
}
