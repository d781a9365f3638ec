//! Fire-and-forget dialog logging.
//!
//! Each session owns a strictly-ordered queue of pending log entries. An
//! enqueue schedules a drain task only when the queue was empty; the drain
//! persists one entry at a time, so per-session entries reach the store in
//! exact enqueue order with at most one call in flight. Persistence
//! failures are logged and swallowed; they never delay or fail a reply.

use crate::session::Session;
use ef_stores::{DialogEntry, DialogStore};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

/// Per-session pending-entry queue. Lives on the session so a "start over"
/// never detaches in-flight logging from its conversation.
pub struct LogQueue {
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    entries: VecDeque<DialogEntry>,
    draining: bool,
    conversation_id: Option<String>,
}

impl Default for LogQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LogQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                draining: false,
                conversation_id: None,
            }),
        }
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.lock().conversation_id.clone()
    }

    pub fn set_conversation_id(&self, conversation_id: String) {
        self.lock().conversation_id = Some(conversation_id);
    }

    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    /// Appends an entry; returns true when the caller must start a drain
    /// (queue was idle).
    fn push(&self, entry: DialogEntry) -> bool {
        let mut inner = self.lock();
        inner.entries.push_back(entry);
        if inner.draining {
            return false;
        }
        inner.draining = true;
        true
    }

    /// Pops the next entry to persist; flips the draining flag off and
    /// returns None when the queue is exhausted.
    fn next(&self) -> Option<(DialogEntry, Option<String>)> {
        let mut inner = self.lock();
        match inner.entries.pop_front() {
            Some(entry) => {
                let conversation_id = inner.conversation_id.clone();
                Some((entry, conversation_id))
            }
            None => {
                inner.draining = false;
                None
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The background logger shared by all handlers.
pub struct DialogLog {
    store: Arc<dyn DialogStore>,
}

impl DialogLog {
    pub fn new(store: Arc<dyn DialogStore>) -> Self {
        Self { store }
    }

    /// Queues one turn for persistence and returns immediately.
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %session.user_id, entry_name = %entry.name))]
    pub fn enqueue(&self, session: &Arc<Session>, entry: DialogEntry) {
        if !session.log.push(entry) {
            // A drain is already in flight and will pick this entry up.
            return;
        }
        let store = self.store.clone();
        let session = session.clone();
        tokio::spawn(async move {
            drain(store, session).await;
        });
    }
}

async fn drain(store: Arc<dyn DialogStore>, session: Arc<Session>) {
    while let Some((entry, conversation_id)) = session.log.next() {
        // A turn logged before any conversation exists creates one even
        // without the new-conversation flag; otherwise it would be lost.
        let create = entry.new_conversation || conversation_id.is_none();
        if create {
            match store.create_conversation(session.user_id.as_str(), &entry).await {
                Ok(id) => session.log.set_conversation_id(id),
                Err(e) => {
                    tracing::warn!(%e, user_id = %session.user_id, entry_name = %entry.name, "conversation create failed; entry dropped");
                }
            }
        } else if let Some(conversation_id) = conversation_id {
            if let Err(e) = store.append_entry(&conversation_id, &entry).await {
                tracing::warn!(%e, user_id = %session.user_id, entry_name = %entry.name, "dialog append failed; entry dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;
    use chrono::Utc;
    use ef_channels::UserId;
    use ef_stores::{MemoryDialogStore, MemoryUserStore};
    use std::time::Duration;

    fn entry(name: &str, message: &str, new_conversation: bool) -> DialogEntry {
        DialogEntry {
            name: name.to_string(),
            message: message.to_string(),
            date: Utc::now(),
            new_conversation,
        }
    }

    async fn test_session() -> Arc<Session> {
        let sessions = SessionStore::new(Arc::new(MemoryUserStore::new()));
        sessions
            .get_or_create(&UserId::new("u-log"))
            .await
            .expect("create session")
    }

    #[tokio::test]
    async fn entries_persist_in_enqueue_order_despite_latency() {
        let store = Arc::new(MemoryDialogStore::with_latency(Duration::from_millis(20)));
        let log = DialogLog::new(store.clone());
        let session = test_session().await;

        log.enqueue(&session, entry("start", "hi", true));
        log.enqueue(&session, entry("search_topic", "jazz", false));
        log.enqueue(&session, entry("search_speaker", "Ada", false));

        // All three entries are pending or in flight; the reply path never
        // waited on them.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            store.call_log().await,
            vec!["create:start", "append:search_topic", "append:search_speaker"]
        );
        assert_eq!(session.log.pending(), 0);
    }

    #[tokio::test]
    async fn enqueue_returns_before_persistence_settles() {
        let store = Arc::new(MemoryDialogStore::with_latency(Duration::from_millis(250)));
        let log = DialogLog::new(store.clone());
        let session = test_session().await;

        let started = std::time::Instant::now();
        log.enqueue(&session, entry("start", "hi", true));
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(store.call_log().await.len() <= 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.call_log().await, vec!["create:start"]);
    }

    #[tokio::test]
    async fn new_conversation_flag_captures_conversation_id() {
        let store = Arc::new(MemoryDialogStore::new());
        let log = DialogLog::new(store.clone());
        let session = test_session().await;

        log.enqueue(&session, entry("start", "hi", true));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let conversation_id = session.log.conversation_id().expect("conversation id set");

        log.enqueue(&session, entry("search_topic", "jazz", false));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(session.log.conversation_id(), Some(conversation_id));
        assert_eq!(store.entry_count().await, 2);
    }

    #[tokio::test]
    async fn entry_without_conversation_id_promotes_to_create() {
        let store = Arc::new(MemoryDialogStore::new());
        let log = DialogLog::new(store.clone());
        let session = test_session().await;

        // First logged turn is not flagged as a new conversation.
        log.enqueue(&session, entry("search_topic", "jazz", false));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.call_log().await, vec!["create:search_topic"]);
        assert!(session.log.conversation_id().is_some());
    }

    #[tokio::test]
    async fn persistence_failure_is_swallowed_and_queue_continues() {
        let store = Arc::new(MemoryDialogStore::new());
        let log = DialogLog::new(store.clone());
        let session = test_session().await;

        log.enqueue(&session, entry("start", "hi", true));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Force an append failure by pointing the queue at a conversation
        // the store does not know.
        session.log.set_conversation_id("conv-unknown".to_string());
        log.enqueue(&session, entry("search_topic", "jazz", false));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The failed entry was dropped, not retried, and the queue is idle.
        assert_eq!(session.log.pending(), 0);

        // A later entry still flows.
        let real_id = store
            .create_conversation("u-log", &entry("start", "again", true))
            .await
            .expect("create");
        session.log.set_conversation_id(real_id);
        log.enqueue(&session, entry("search_speaker", "Ada", false));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store
            .call_log()
            .await
            .contains(&"append:search_speaker".to_string()));
    }
}
