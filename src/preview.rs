use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::now_ms;
use crate::engine::EngineError;
use crate::limits::*;
use crate::model::{GuestListSource, Ms};
use crate::validation::{GuestRow, RowPreview};

/// A guest-list submission waiting for correction or confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewData {
    pub booking_id: Ulid,
    pub agency_id: Ulid,
    pub source: GuestListSource,
    pub rows: Vec<RowPreview>,
    pub general_errors: Vec<String>,
    /// Rows as handed in, importer errors included. A bare confirm
    /// re-checks these.
    pub submitted: Vec<GuestRow>,
}

struct Session {
    data: PreviewData,
    expires_at: Ms,
}

/// In-process staging area with a fixed lifetime per session. Expiry is
/// absolute from creation; reading a session does not extend it.
pub struct PreviewStore {
    sessions: Mutex<HashMap<Ulid, Session>>,
    ttl_ms: Ms,
}

impl Default for PreviewStore {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl_ms: PREVIEW_TTL_MS,
        }
    }
}

impl PreviewStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl_ms: Ms::try_from(ttl.as_millis()).unwrap_or(Ms::MAX),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Ulid, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create(&self, data: PreviewData) -> Result<Ulid, EngineError> {
        self.create_at(data, now_ms())
    }

    /// Every create first sweeps out expired sessions.
    pub fn create_at(&self, data: PreviewData, now: Ms) -> Result<Ulid, EngineError> {
        let mut sessions = self.sessions();
        sessions.retain(|_, s| s.expires_at > now);
        if sessions.len() >= MAX_PREVIEW_SESSIONS {
            return Err(EngineError::LimitExceeded("too many open preview sessions"));
        }
        let id = Ulid::new();
        sessions.insert(
            id,
            Session {
                data,
                expires_at: now.saturating_add(self.ttl_ms),
            },
        );
        metrics::gauge!(crate::observability::PREVIEW_SESSIONS_ACTIVE).set(sessions.len() as f64);
        Ok(id)
    }

    pub fn get(&self, id: Ulid) -> Option<PreviewData> {
        self.get_at(id, now_ms())
    }

    /// A session past its expiry is dropped on sight.
    pub fn get_at(&self, id: Ulid, now: Ms) -> Option<PreviewData> {
        let mut sessions = self.sessions();
        let expired = match sessions.get(&id) {
            Some(s) if s.expires_at > now => return Some(s.data.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            sessions.remove(&id);
            metrics::gauge!(crate::observability::PREVIEW_SESSIONS_ACTIVE)
                .set(sessions.len() as f64);
        }
        None
    }

    pub fn delete(&self, id: Ulid) -> bool {
        let mut sessions = self.sessions();
        let removed = sessions.remove(&id).is_some();
        metrics::gauge!(crate::observability::PREVIEW_SESSIONS_ACTIVE).set(sessions.len() as f64);
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
