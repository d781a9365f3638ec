//! In-memory implementations of the collaborator traits, used by tests and
//! by the dev runtime when no external services are configured.

use crate::dialogs::{collect_recent_searches, ConversationDoc};
use crate::error::{Result, StoreError};
use crate::traits::{DialogStore, EventStore, SmsSender, UrlShortener, UserStore};
use crate::types::{DialogEntry, EventItem, RecentSearch, SearchKind, UserRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryEventStore {
    events: Vec<EventItem>,
    fail_searches: bool,
}

impl MemoryEventStore {
    pub fn new(events: Vec<EventItem>) -> Self {
        Self {
            events,
            fail_searches: false,
        }
    }

    /// Makes every search call fail, for error-path tests.
    pub fn failing() -> Self {
        Self {
            events: Vec::new(),
            fail_searches: true,
        }
    }

    fn matches(&self, query: &str) -> Vec<EventItem> {
        let needle = query.to_lowercase();
        self.events
            .iter()
            .filter(|e| e.name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn search(
        &self,
        _kind: SearchKind,
        query: &str,
        _window_hours: u32,
        max_results: usize,
    ) -> Result<Vec<EventItem>> {
        if self.fail_searches {
            return Err(StoreError::Search("injected search failure".to_string()));
        }
        let mut events = self.matches(query);
        events.truncate(max_results);
        Ok(events)
    }

    async fn suggested(
        &self,
        _seed_terms: &[String],
        _window_hours: u32,
        max_results: usize,
    ) -> Result<Vec<EventItem>> {
        if self.fail_searches {
            return Err(StoreError::Search("injected search failure".to_string()));
        }
        Ok(self.events.iter().take(max_results).cloned().collect())
    }

    async fn events_for_ids(&self, ids: &[String]) -> Result<Vec<EventItem>> {
        Ok(self
            .events
            .iter()
            .filter(|e| ids.contains(&e.id))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, UserRecord>>,
    fail_writes: bool,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_writes() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            fail_writes: true,
        }
    }

    pub async fn insert(&self, record: UserRecord) {
        self.users.lock().await.insert(record.id.clone(), record);
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_by_id(&self, user_id: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.lock().await.get(user_id).cloned())
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<UserRecord>> {
        Ok(self
            .users
            .lock()
            .await
            .values()
            .find(|u| u.token.as_deref() == Some(token))
            .cloned())
    }

    async fn create(&self, user_id: &str, token: &str) -> Result<UserRecord> {
        if self.fail_writes {
            return Err(StoreError::Persistence("injected write failure".to_string()));
        }
        let record = UserRecord {
            id: user_id.to_string(),
            token: Some(token.to_string()),
            name: None,
        };
        self.insert(record.clone()).await;
        Ok(record)
    }

    async fn set_name(&self, user_id: &str, name: &str) -> Result<()> {
        if self.fail_writes {
            return Err(StoreError::Persistence("injected write failure".to_string()));
        }
        let mut users = self.users.lock().await;
        if let Some(record) = users.get_mut(user_id) {
            record.name = Some(name.to_string());
        } else {
            users.insert(
                user_id.to_string(),
                UserRecord {
                    id: user_id.to_string(),
                    token: None,
                    name: Some(name.to_string()),
                },
            );
        }
        Ok(())
    }
}

struct MemoryConversation {
    id: String,
    user_id: String,
    entries: Vec<DialogEntry>,
}

/// Records persistence calls in order; an injectable latency lets tests
/// assert that replies do not wait on dialog logging.
#[derive(Default)]
pub struct MemoryDialogStore {
    conversations: Mutex<Vec<MemoryConversation>>,
    calls: Mutex<Vec<String>>,
    latency: Option<Duration>,
}

impl MemoryDialogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            conversations: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            latency: Some(latency),
        }
    }

    /// Persistence calls observed so far, in order.
    pub async fn call_log(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn entry_count(&self) -> usize {
        self.conversations
            .lock()
            .await
            .iter()
            .map(|c| c.entries.len())
            .sum()
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl DialogStore for MemoryDialogStore {
    async fn create_conversation(&self, user_id: &str, entry: &DialogEntry) -> Result<String> {
        self.pause().await;
        let id = Uuid::new_v4().to_string();
        self.calls.lock().await.push(format!("create:{}", entry.name));
        self.conversations.lock().await.push(MemoryConversation {
            id: id.clone(),
            user_id: user_id.to_string(),
            entries: vec![entry.clone()],
        });
        Ok(id)
    }

    async fn append_entry(&self, conversation_id: &str, entry: &DialogEntry) -> Result<()> {
        self.pause().await;
        self.calls.lock().await.push(format!("append:{}", entry.name));
        let mut conversations = self.conversations.lock().await;
        let Some(conversation) = conversations.iter_mut().find(|c| c.id == conversation_id) else {
            return Err(StoreError::Persistence(format!(
                "unknown conversation: {conversation_id}"
            )));
        };
        conversation.entries.push(entry.clone());
        Ok(())
    }

    async fn recent_searches_for(&self, user_id: &str, limit: usize) -> Result<Vec<RecentSearch>> {
        let conversations = self.conversations.lock().await;
        // Newest conversation first, matching the HTTP store's sort.
        let docs: Vec<ConversationDoc> = conversations
            .iter()
            .rev()
            .filter(|c| c.user_id == user_id)
            .map(|c| ConversationDoc {
                dialogs: c.entries.clone(),
            })
            .collect();
        Ok(collect_recent_searches(&docs, limit))
    }
}

#[derive(Default)]
pub struct MemorySmsSender {
    sent: Mutex<Vec<(String, String)>>,
    fail_sends: bool,
}

impl MemorySmsSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_sends: true,
        }
    }

    pub async fn sent_messages(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl SmsSender for MemorySmsSender {
    async fn send(&self, to_number: &str, body: &str) -> Result<String> {
        if self.fail_sends {
            return Err(StoreError::Sms("injected sms failure".to_string()));
        }
        self.sent
            .lock()
            .await
            .push((to_number.to_string(), body.to_string()));
        Ok(format!("SM{}", Uuid::new_v4().simple()))
    }
}

/// Passes the long URL through unchanged; used when shortening is disabled.
#[derive(Default, Clone, Copy)]
pub struct NoopShortener;

#[async_trait]
impl UrlShortener for NoopShortener {
    async fn shorten(&self, long_url: &str) -> Result<String> {
        Ok(long_url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(name: &str, message: &str, new_conversation: bool) -> DialogEntry {
        DialogEntry {
            name: name.to_string(),
            message: message.to_string(),
            date: Utc::now(),
            new_conversation,
        }
    }

    #[tokio::test]
    async fn dialog_store_records_calls_in_order() {
        let store = MemoryDialogStore::new();
        let id = store
            .create_conversation("u-1", &entry("start", "hi", true))
            .await
            .expect("create");
        store
            .append_entry(&id, &entry("search_topic", "jazz", false))
            .await
            .expect("append");

        assert_eq!(store.call_log().await, vec!["create:start", "append:search_topic"]);
        assert_eq!(store.entry_count().await, 2);
    }

    #[tokio::test]
    async fn recent_searches_walk_newest_conversation_first() {
        let store = MemoryDialogStore::new();
        let first = store
            .create_conversation("u-1", &entry("search_topic", "jazz", true))
            .await
            .expect("create");
        store
            .append_entry(&first, &entry("search_speaker", "Ada", false))
            .await
            .expect("append");
        store
            .create_conversation("u-1", &entry("search_topic", "blues", true))
            .await
            .expect("create second");

        let searches = store
            .recent_searches_for("u-1", 10)
            .await
            .expect("recent searches");
        assert_eq!(searches[0].message, "blues");
        assert_eq!(searches[1].message, "jazz");
        assert_eq!(searches[2].message, "Ada");
    }

    #[tokio::test]
    async fn user_store_set_name_round_trips() {
        let store = MemoryUserStore::new();
        store.create("u-1", "tok").await.expect("create");
        store.set_name("u-1", "Grace").await.expect("set name");
        let record = store
            .get_by_id("u-1")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(record.name.as_deref(), Some("Grace"));
    }
}
