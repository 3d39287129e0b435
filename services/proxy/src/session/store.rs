use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;
use veil_id::SessionId;

use super::{Session, SessionError};

/// Counters for a store. Read with [`SessionStore::stats`].
#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    removed: AtomicU64,
    connections_closed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub active: usize,
    pub created: u64,
    pub removed: u64,
    pub connections_closed: u64,
}

/// Thread-safe table of sessions keyed by id.
///
/// The map is sharded; each session has its own lock. No operation holds
/// a map shard across an await point.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<Session>>,
    counters: Counters,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, id: SessionId, sni: &str) -> Result<Arc<Session>, SessionError> {
        match self.sessions.entry(id) {
            Entry::Occupied(_) => Err(SessionError::Exists(id)),
            Entry::Vacant(entry) => {
                let session = Arc::new(Session::new(id, sni));
                entry.insert(Arc::clone(&session));
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                Ok(session)
            }
        }
    }

    /// An absent id is not an error; callers decide what "not found" means.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn require(&self, id: &SessionId) -> Result<Arc<Session>, SessionError> {
        self.get(id).ok_or(SessionError::NotFound(*id))
    }

    pub async fn append_client_message(
        &self,
        id: &SessionId,
        bytes: Vec<u8>,
    ) -> Result<(), SessionError> {
        self.require(id)?.append_client_message(bytes).await;
        Ok(())
    }

    pub async fn append_server_response(
        &self,
        id: &SessionId,
        bytes: Vec<u8>,
    ) -> Result<(), SessionError> {
        self.require(id)?.append_server_response(bytes).await
    }

    pub async fn advance_cursor(&self, id: &SessionId) -> Result<Option<Vec<u8>>, SessionError> {
        Ok(self.require(id)?.advance_cursor().await)
    }

    pub async fn mark_complete(&self, id: &SessionId) -> Result<bool, SessionError> {
        Ok(self.require(id)?.mark_complete().await)
    }

    pub async fn mark_adopted(&self, id: &SessionId) -> Result<usize, SessionError> {
        Ok(self.require(id)?.mark_adopted().await)
    }

    /// Removes a session and closes its target connection first.
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        self.counters.removed.fetch_add(1, Ordering::Relaxed);
        if session.close().await {
            self.counters
                .connections_closed
                .fetch_add(1, Ordering::Relaxed);
            debug!(session_id = %id, "Closed target connection");
        }
        Some(session)
    }

    /// Sessions whose last activity is at least `threshold` ago.
    pub fn idle_sessions(&self, threshold: Duration) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= threshold)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Removes every session. Used at shutdown.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut removed = 0;
        for id in ids {
            if self.remove(&id).await.is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            active: self.sessions.len(),
            created: self.counters.created.load(Ordering::Relaxed),
            removed: self.counters.removed.load(Ordering::Relaxed),
            connections_closed: self.counters.connections_closed.load(Ordering::Relaxed),
        }
    }
}
