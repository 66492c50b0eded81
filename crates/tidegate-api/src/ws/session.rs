//! Session registry.
//!
//! At most one active session per (user, chat) pair. Registering a new
//! session for a key replaces the previous one and aborts its heartbeat
//! task, so a reconnecting client never leaves an orphaned timer behind.
//! Connect and disconnect can race with heartbeat teardown of the same
//! key, hence the concurrent map.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use super::liveness::Liveness;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: String,
    pub chat_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            chat_id: chat_id.into(),
        }
    }
}

/// Session lifecycle. Strictly forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Connecting,
    Open,
    Closing,
    Closed,
}

pub struct SessionHandle {
    pub liveness: Arc<Liveness>,
    phase: Mutex<SessionPhase>,
    heartbeat: JoinHandle<()>,
}

impl SessionHandle {
    pub fn new(liveness_threshold: Duration, heartbeat: JoinHandle<()>) -> Self {
        Self {
            liveness: Arc::new(Liveness::new(liveness_threshold)),
            phase: Mutex::new(SessionPhase::Connecting),
            heartbeat,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
            .lock()
            .map(|p| *p)
            .unwrap_or(SessionPhase::Closed)
    }

    /// Advance the lifecycle. Backward moves and moves out of `Closed`
    /// are ignored; returns whether the transition happened.
    pub fn advance(&self, next: SessionPhase) -> bool {
        if let Ok(mut phase) = self.phase.lock() {
            if *phase < next {
                *phase = next;
                return true;
            }
        }
        false
    }

    fn abort(&self) {
        self.heartbeat.abort();
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, displacing any previous one under the key.
    pub fn register(&self, key: SessionKey, handle: Arc<SessionHandle>) {
        if let Some(previous) = self.sessions.insert(key.clone(), handle) {
            tracing::debug!(user_id = %key.user_id, chat_id = %key.chat_id, "replacing session");
            previous.advance(SessionPhase::Closed);
            previous.abort();
        }
    }

    /// Tear down the session under the key, if it is the given one.
    /// Idempotent: repeated calls and calls for already-replaced handles
    /// are no-ops.
    pub fn teardown(&self, key: &SessionKey, handle: &Arc<SessionHandle>) {
        handle.advance(SessionPhase::Closed);
        handle.abort();
        // Only remove the registry entry if it still points at us; a
        // reconnect may already have replaced it.
        self.sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, handle));
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<SessionHandle>> {
        self.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
