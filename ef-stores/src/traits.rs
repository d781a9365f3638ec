use crate::error::Result;
use crate::types::{DialogEntry, EventItem, RecentSearch, SearchKind, UserRecord};
use async_trait::async_trait;

/// Event/session search index. Implementations may progressively widen the
/// time window and retry when zero results come back, up to their configured
/// maximum window.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn search(
        &self,
        kind: SearchKind,
        query: &str,
        window_hours: u32,
        max_results: usize,
    ) -> Result<Vec<EventItem>>;

    /// Suggested events: an OR over configured seed terms.
    async fn suggested(
        &self,
        seed_terms: &[String],
        window_hours: u32,
        max_results: usize,
    ) -> Result<Vec<EventItem>>;

    async fn events_for_ids(&self, ids: &[String]) -> Result<Vec<EventItem>>;
}

/// User profile persistence. `get_by_id` returns `None` for unknown users,
/// never an error.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_id(&self, user_id: &str) -> Result<Option<UserRecord>>;
    async fn get_by_token(&self, token: &str) -> Result<Option<UserRecord>>;
    async fn create(&self, user_id: &str, token: &str) -> Result<UserRecord>;
    async fn set_name(&self, user_id: &str, name: &str) -> Result<()>;
}

/// Dialog-turn persistence plus the recent-searches query over it.
#[async_trait]
pub trait DialogStore: Send + Sync {
    /// Persists the first turn of a conversation and returns the id all
    /// later turns attach to.
    async fn create_conversation(&self, user_id: &str, entry: &DialogEntry) -> Result<String>;

    async fn append_entry(&self, conversation_id: &str, entry: &DialogEntry) -> Result<()>;

    /// Distinct prior searches for a user, most recent first, capped at
    /// `limit`.
    async fn recent_searches_for(&self, user_id: &str, limit: usize) -> Result<Vec<RecentSearch>>;
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Returns the provider's message handle.
    async fn send(&self, to_number: &str, body: &str) -> Result<String>;
}

#[async_trait]
pub trait UrlShortener: Send + Sync {
    async fn shorten(&self, long_url: &str) -> Result<String>;
}
