// src/core/registry.rs

//! The gateway-wide session registry.
//!
//! Nicknames are unique across all connections, and no two top-level sessions
//! may bind the same destination. A session is claimed in two steps: `reserve`
//! the nickname and destination, build the transport binding, then `commit` the
//! live session. Until committed, lookups treat the entry as absent, and a
//! dropped reservation frees both names again.

use crate::core::SamError;
use crate::core::lifecycle::LifecycleGroup;
use crate::core::metrics;
use crate::core::protocol::Props;
use crate::core::sessions::{SessionKind, Style};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// One registry entry.
pub struct SessionRecord {
    pub nickname: String,
    pub destination: String,
    /// The private keystream the session was created from.
    pub keystream: String,
    pub props: Props,
    pub style: Style,
    /// The connection that created the session.
    pub owner: u64,
    /// Set for sub-sessions: the primary's nickname.
    pub parent: Option<String>,
    pub group: Arc<LifecycleGroup>,
    session: OnceLock<SessionKind>,
}

impl SessionRecord {
    pub fn new(
        nickname: String,
        destination: String,
        keystream: String,
        props: Props,
        style: Style,
        owner: u64,
        parent: Option<String>,
    ) -> Self {
        let group = Arc::new(LifecycleGroup::new(nickname.clone()));
        Self {
            nickname,
            destination,
            keystream,
            props,
            style,
            owner,
            parent,
            group,
            session: OnceLock::new(),
        }
    }

    /// The live session, once committed.
    pub fn session(&self) -> Option<&SessionKind> {
        self.session.get()
    }

    /// Stops the session's workers, then releases its transport binding.
    async fn shutdown(&self) {
        self.group.shutdown().await;
        if let Some(session) = self.session.get() {
            session.close().await;
        }
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("nickname", &self.nickname)
            .field("destination", &self.destination)
            .field("keystream", &"<redacted>")
            .field("style", &self.style)
            .field("owner", &self.owner)
            .field("parent", &self.parent)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionRecord>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the record's nickname and, for a top-level session, its
    /// destination. Both checks and the insert happen under one lock.
    pub fn reserve(self: &Arc<Self>, record: SessionRecord) -> Result<Reservation, SamError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&record.nickname) {
            return Err(SamError::DuplicatedId(record.nickname));
        }
        if record.parent.is_none()
            && sessions
                .values()
                .any(|r| r.parent.is_none() && r.destination == record.destination)
        {
            return Err(SamError::DuplicatedDest);
        }
        let record = Arc::new(record);
        sessions.insert(record.nickname.clone(), record.clone());
        Ok(Reservation {
            registry: self.clone(),
            record,
            committed: false,
        })
    }

    /// A committed session by nickname.
    pub fn get(&self, nickname: &str) -> Option<Arc<SessionRecord>> {
        self.sessions
            .lock()
            .get(nickname)
            .filter(|r| r.session().is_some())
            .cloned()
    }

    /// Number of entries, reservations included.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nicknames of the sub-sessions under `parent`.
    pub fn children_of(&self, parent: &str) -> Vec<String> {
        self.sessions
            .lock()
            .values()
            .filter(|r| r.parent.as_deref() == Some(parent))
            .map(|r| r.nickname.clone())
            .collect()
    }

    /// Tears a session down and frees its names. A primary's sub-sessions go
    /// first. Returns `false` if no such session exists.
    pub async fn close(&self, nickname: &str) -> bool {
        for child in self.children_of(nickname) {
            self.close_entry(&child).await;
        }
        self.close_entry(nickname).await
    }

    async fn close_entry(&self, nickname: &str) -> bool {
        let Some(record) = self.sessions.lock().get(nickname).cloned() else {
            return false;
        };
        record.shutdown().await;

        let removed = {
            let mut sessions = self.sessions.lock();
            match sessions.get(nickname) {
                Some(current) if Arc::ptr_eq(current, &record) => sessions.remove(nickname).is_some(),
                _ => false,
            }
        };
        if removed && record.session().is_some() {
            metrics::ACTIVE_SESSIONS.dec();
        }
        info!("Session '{nickname}' closed.");
        true
    }

    /// Closes every session, used at gateway shutdown.
    pub async fn shutdown_all(&self) {
        let top_level: Vec<String> = self
            .sessions
            .lock()
            .values()
            .filter(|r| r.parent.is_none())
            .map(|r| r.nickname.clone())
            .collect();
        debug!("Closing {} session(s).", top_level.len());
        for nickname in top_level {
            self.close(&nickname).await;
        }
    }

    fn release(&self, record: &Arc<SessionRecord>) {
        let mut sessions = self.sessions.lock();
        if let Some(current) = sessions.get(&record.nickname) {
            if Arc::ptr_eq(current, record) {
                sessions.remove(&record.nickname);
            }
        }
    }
}

/// A claimed but not yet live registry entry. Dropping it frees the names.
pub struct Reservation {
    registry: Arc<SessionRegistry>,
    record: Arc<SessionRecord>,
    committed: bool,
}

impl Reservation {
    pub fn record(&self) -> &Arc<SessionRecord> {
        &self.record
    }

    /// Publishes the live session.
    pub fn commit(mut self, session: SessionKind) -> Arc<SessionRecord> {
        // A reservation is only ever committed once, so the cell is empty.
        let _ = self.record.session.set(session);
        self.committed = true;
        metrics::ACTIVE_SESSIONS.inc();
        debug!("Session '{}' committed.", self.record.nickname);
        self.record.clone()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.release(&self.record);
        }
    }
}
