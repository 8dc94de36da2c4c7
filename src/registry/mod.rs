//! Session registry
//!
//! The only process-wide mutable map. Active protocol sessions are indexed
//! by UUID, with a secondary index by secret for the WHIP/WHEP PATCH/DELETE
//! rendezvous. The lock is held only for insert, remove and single-key
//! lookup; snapshots copy out and sort outside the lock.

pub mod session;

pub use session::{SessionInfo, SessionProtocol, SessionSnapshot, SessionState};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::error::{RelayError, Result};

#[derive(Debug, Default)]
struct Inner {
    by_id: HashMap<Uuid, Arc<SessionInfo>>,
    /// secret -> session id; WebRTC sessions only
    by_secret: HashMap<Uuid, Uuid>,
}

/// Index of all active protocol sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a session; UUIDs are unique for the process lifetime
    pub fn register(&self, session: Arc<SessionInfo>) -> Result<()> {
        let mut inner = self.write();

        if inner.by_id.contains_key(&session.id) {
            return Err(RelayError::Internal(format!(
                "duplicate session id {}",
                session.id
            )));
        }
        if let Some(secret) = session.secret {
            if inner.by_secret.contains_key(&secret) {
                return Err(RelayError::Internal(format!(
                    "duplicate session secret for {}",
                    session.id
                )));
            }
            inner.by_secret.insert(secret, session.id);
        }
        inner.by_id.insert(session.id, session);
        Ok(())
    }

    /// Remove a session; idempotent
    pub fn unregister(&self, id: &Uuid) {
        let mut inner = self.write();
        if let Some(session) = inner.by_id.remove(id) {
            if let Some(secret) = session.secret {
                inner.by_secret.remove(&secret);
            }
        }
    }

    /// Single-key lookup by session id
    pub fn get(&self, id: &Uuid) -> Option<Arc<SessionInfo>> {
        self.read().by_id.get(id).cloned()
    }

    /// Resolve a WHIP/WHEP secret to its session
    pub fn lookup_by_secret(&self, secret: &Uuid) -> Option<Arc<SessionInfo>> {
        let inner = self.read();
        let id = inner.by_secret.get(secret)?;
        inner.by_id.get(id).cloned()
    }

    /// Point-in-time copy of one protocol's sessions, creation-time ordered
    /// so API paging is stable
    pub fn snapshot_by_protocol(&self, protocol: SessionProtocol) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<SessionInfo>> = {
            let inner = self.read();
            inner
                .by_id
                .values()
                .filter(|s| s.protocol == protocol)
                .cloned()
                .collect()
        };

        let mut snapshots: Vec<SessionSnapshot> =
            sessions.iter().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Number of active sessions across all protocols
    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
