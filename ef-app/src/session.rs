//! Per-user conversation state.
//!
//! One `Session` per durable identity, created on the first inbound turn and
//! kept for the life of the process.

use crate::dialog_log::LogQueue;
use dashmap::DashMap;
use ef_channels::UserId;
use ef_stores::{EventItem, RecentSearch, Result, UserStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Transient dialog state, replaced wholesale by `clear`.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Display name; survives `clear` and is persisted to the user store.
    pub username: Option<String>,
    /// Opaque blob round-tripped with the dialog oracle.
    pub context: Map<String, Value>,
    /// Most recent search hits, for a later "text me the results".
    pub last_results: Vec<EventItem>,
    pub last_share_url: Option<String>,
    /// Rendered recent-searches list, for selection by index.
    pub recent_searches: Vec<RecentSearch>,
}

pub struct Session {
    pub user_id: UserId,
    pub state: Mutex<SessionState>,
    /// Pending dialog-log entries; owned here so in-flight logging survives
    /// a "start over".
    pub log: LogQueue,
}

impl Session {
    fn new(user_id: UserId, username: Option<String>) -> Self {
        Self {
            user_id,
            state: Mutex::new(SessionState {
                username,
                ..SessionState::default()
            }),
            log: LogQueue::new(),
        }
    }

    /// Resets transient dialog state. Never touches the user identity, the
    /// username, the pending log queue, or the conversation id.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.context = Map::new();
        state.last_results.clear();
        state.last_share_url = None;
        state.recent_searches.clear();
    }
}

pub struct SessionStore {
    sessions: DashMap<UserId, Arc<Session>>,
    users: Arc<dyn UserStore>,
}

impl SessionStore {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self {
            sessions: DashMap::new(),
            users,
        }
    }

    /// Fetches the session for `user_id`, creating it (seeded with the
    /// stored display name) on first contact.
    ///
    /// Concurrent first turns may both fetch the profile, but the map entry
    /// publish ensures a single session object wins, so queue ordering is
    /// never split across duplicates.
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %user_id))]
    pub async fn get_or_create(&self, user_id: &UserId) -> Result<Arc<Session>> {
        if let Some(session) = self.sessions.get(user_id) {
            return Ok(session.clone());
        }

        let username = self
            .users
            .get_by_id(user_id.as_str())
            .await?
            .and_then(|record| record.name);
        let session = Arc::new(Session::new(user_id.clone(), username));
        let published = self
            .sessions
            .entry(user_id.clone())
            .or_insert(session)
            .clone();
        Ok(published)
    }

    pub fn get(&self, user_id: &UserId) -> Option<Arc<Session>> {
        self.sessions.get(user_id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
