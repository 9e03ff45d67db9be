use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::observability::metrics as obs;

/// Session lifecycle states shown on the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Handshaking,
    Relaying,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Handshaking => write!(f, "handshaking"),
            SessionState::Relaying => write!(f, "relaying"),
            SessionState::Closing => write!(f, "closing"),
        }
    }
}

/// Snapshot of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub request_id: String,
    pub client_addr: String,
    pub upstream: String,
    pub start_time: DateTime<Utc>,
    pub state: SessionState,
}

/// Live-session index: request-id to snapshot.
///
/// An injected handle rather than a process-wide global, so tests (and any
/// embedding) can run one tracker per engine. Entries are inserted when a
/// session starts and removed when its handler returns.
#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: DashMap<String, SessionInfo>,
}

/// Generate a session request id: 128 random bits as 32 hex chars.
pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: SessionInfo) {
        self.sessions.insert(info.request_id.clone(), info);
        obs::set_active_sessions(self.sessions.len());
    }

    pub fn set_state(&self, request_id: &str, state: SessionState) {
        if let Some(mut entry) = self.sessions.get_mut(request_id) {
            entry.state = state;
        }
    }

    pub fn set_upstream(&self, request_id: &str, upstream: &str) {
        if let Some(mut entry) = self.sessions.get_mut(request_id) {
            entry.upstream = upstream.to_string();
        }
    }

    pub fn remove(&self, request_id: &str) {
        self.sessions.remove(request_id);
        obs::set_active_sessions(self.sessions.len());
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }
}
