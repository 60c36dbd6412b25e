//! The process-wide table of live sessions, used for broadcast.
//!
//! Grounded on the reference websocket transport's global connection map:
//! every open session registers itself here on construction and removes
//! itself on close, and [`ConnectionRegistry::broadcast`] fans a call out to
//! a snapshot of whoever is registered at the moment it is called. Taking a
//! snapshot before iterating (rather than iterating the live map directly)
//! avoids the mutate-while-iterating hazard the reference implementation's
//! broadcast had when a callback closed its own session mid-broadcast.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::session::Session;

/// A process-wide registry of currently-open sessions.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl ConnectionRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Replaces any prior entry with the same id.
    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id().to_string(), session);
    }

    /// Remove a session by id, if present.
    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    /// Number of currently-registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether any sessions are currently registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// A point-in-time list of the currently-registered sessions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Fetch one session by id, if it is still registered.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Make the same call against every session registered at the moment of
    /// the call, without waiting for any of their replies.
    ///
    /// Each session's call runs on its own spawned task; a slow or
    /// unresponsive peer cannot block delivery to the others, and a peer
    /// that closes its session from within its own handler cannot corrupt
    /// this broadcast's iteration since it already has its own snapshot.
    pub fn broadcast(&self, call: impl Into<String>, args: Value) {
        let call = call.into();
        for session in self.snapshot() {
            let call = call.clone();
            let args = args.clone();
            tokio::spawn(async move {
                if let Err(err) = session.call(call, args).await {
                    tracing::debug!(session = %session.id(), %err, "broadcast call failed");
                }
            });
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
