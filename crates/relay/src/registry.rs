//! Session registry.
//!
//! Owns every live [`StreamSession`], indexed by source key, with a reverse
//! id -> source index so disconnects by id need no scan. Only the manager
//! task touches it, so it carries no locking of its own.

use std::collections::HashMap;

use thiserror::Error;

use crate::session::{ActiveStream, SessionId, StreamSession};
use crate::source::SourceKey;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A session for this source already exists
    #[error("a session for {0} is already registered")]
    DuplicateSource(SourceKey),
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_source: HashMap<SourceKey, StreamSession>,
    by_id: HashMap<SessionId, SourceKey>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &SourceKey) -> Option<&StreamSession> {
        self.by_source.get(key)
    }

    pub fn lookup_mut(&mut self, key: &SourceKey) -> Option<&mut StreamSession> {
        self.by_source.get_mut(key)
    }

    pub fn lookup_by_id(&self, id: &SessionId) -> Option<&SourceKey> {
        self.by_id.get(id)
    }

    /// Add a session. Rejects (and hands back) a session whose source is taken.
    pub fn insert(&mut self, session: StreamSession) -> Result<(), (RegistryError, StreamSession)> {
        if self.by_source.contains_key(session.key()) {
            let key = session.key().clone();
            return Err((RegistryError::DuplicateSource(key), session));
        }
        self.by_id.insert(session.id, session.key().clone());
        self.by_source.insert(session.key().clone(), session);
        Ok(())
    }

    /// Remove by source from both indexes. Absent keys are a no-op.
    pub fn remove(&mut self, key: &SourceKey) -> Option<StreamSession> {
        let session = self.by_source.remove(key)?;
        self.by_id.remove(&session.id);
        Some(session)
    }

    /// Remove by id. Absent ids are a no-op.
    pub fn remove_by_id(&mut self, id: &SessionId) -> Option<StreamSession> {
        let key = self.by_id.get(id)?.clone();
        self.remove(&key)
    }

    /// Take every session out, leaving the registry empty.
    pub fn drain(&mut self) -> Vec<StreamSession> {
        self.by_id.clear();
        self.by_source.drain().map(|(_, session)| session).collect()
    }

    /// Snapshot ordered by creation time, oldest first.
    pub fn snapshot(&self) -> Vec<ActiveStream> {
        let mut streams: Vec<ActiveStream> =
            self.by_source.values().map(StreamSession::snapshot).collect();
        streams.sort_by_key(|s| s.created_at_unix_ms);
        streams
    }

    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }
}
