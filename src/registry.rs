//! Registry of live sessions

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{event::EventRecord, session::Session};

/// Where a routed record ended up.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Appended to the session owning the record's correlation id.
    Correlated(Arc<Session>),
    /// No correlation id; appended to this many sessions.
    Broadcast(usize),
    /// Correlation id present but no session holds that token; dropped.
    Unrouted(String),
}

/// Ordered set of all live sessions, keyed by token.
///
/// The lock guards membership only; each session guards its own state.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<Vec<Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a session by token (surrounding whitespace ignored).
    pub async fn find(&self, token: &str) -> Option<Arc<Session>> {
        let token = token.trim();
        self.sessions
            .read()
            .await
            .iter()
            .find(|s| s.token() == token)
            .cloned()
    }

    /// Find-or-create the session for `token` and set its display name.
    ///
    /// Lookup and insertion happen under one write lock, so concurrent
    /// registrations of the same token yield one session. A blank token
    /// always creates a new session with a generated token.
    pub async fn register(&self, token: &str, name: &str) -> Arc<Session> {
        let token = token.trim();
        let mut sessions = self
            .sessions
            .write()
            .await;

        let existing = if token.is_empty() {
            None
        } else {
            sessions
                .iter()
                .find(|s| s.token() == token)
                .cloned()
        };

        let session = match existing {
            Some(session) => session,
            None => {
                let session = Arc::new(Session::new(token));
                sessions.push(session.clone());
                session
            }
        };
        drop(sessions);

        session
            .set_name(name)
            .await;
        info!("[REGISTRY] Registered {} token={}", name, session.token());
        session
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions
            .read()
            .await
            .len()
    }

    /// `true` if no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of the current sessions in registration order.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .clone()
    }

    /// Deliver a decoded record.
    ///
    /// A non-empty `ActionID` routes to that session only; otherwise the
    /// record is appended to every session.
    pub async fn route(&self, record: EventRecord) -> Delivery {
        match record.action_id() {
            Some(id) => {
                let id = id.to_string();
                match self.find(&id).await {
                    Some(session) => {
                        session
                            .add_event(record)
                            .await;
                        Delivery::Correlated(session)
                    }
                    None => {
                        warn!("[ROUTER] No session with token {}, dropping record", id);
                        Delivery::Unrouted(id)
                    }
                }
            }
            None => {
                // Snapshot first: no membership lock held while session locks are taken.
                let sessions = self.sessions().await;
                for session in &sessions {
                    session
                        .add_event(record.clone())
                        .await;
                }
                debug!("[ROUTER] Broadcast record to {} session(s)", sessions.len());
                Delivery::Broadcast(sessions.len())
            }
        }
    }

    /// Remove sessions idle for longer than `threshold`, returning them.
    ///
    /// The collection is only replaced when something was removed.
    pub async fn evict_idle(&self, threshold: Duration) -> Vec<Arc<Session>> {
        let mut sessions = self
            .sessions
            .write()
            .await;
        let now = Instant::now();

        let mut kept = Vec::with_capacity(sessions.len());
        let mut evicted = Vec::new();
        for session in sessions.iter() {
            if session
                .idle_for(now)
                .await
                > threshold
            {
                info!(
                    "[EVICT] Removing idle session {} token={}",
                    session
                        .name()
                        .await,
                    session.token()
                );
                evicted.push(session.clone());
            } else {
                kept.push(session.clone());
            }
        }

        if !evicted.is_empty() {
            *sessions = kept;
        }
        evicted
    }
}
