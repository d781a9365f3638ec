use crate::error::{Result, StoreError};
use crate::traits::DialogStore;
use crate::types::{DialogEntry, RecentSearch, SearchKind};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

/// Dialog-persistence client: one document per conversation, turns appended
/// to its `dialogs` array.
#[derive(Clone)]
pub struct HttpDialogStore {
    http: reqwest::Client,
    base_url: String,
    db_name: String,
    username: String,
    password: String,
}

impl HttpDialogStore {
    pub fn new(base_url: &str, db_name: &str, username: &str, password: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            db_name: db_name.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

#[async_trait]
impl DialogStore for HttpDialogStore {
    async fn create_conversation(&self, user_id: &str, entry: &DialogEntry) -> Result<String> {
        let doc = serde_json::json!({
            "userId": user_id,
            "date": Utc::now().timestamp_millis(),
            "dialogs": [entry],
        });
        let url = format!("{}/{}", self.base_url, self.db_name);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&doc)
            .send()
            .await
            .map_err(|e| StoreError::Persistence(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Persistence(format!(
                "conversation create status={status} body={body}"
            )));
        }

        let parsed: InsertResponse = serde_json::from_str(&body)?;
        Ok(parsed.id)
    }

    async fn append_entry(&self, conversation_id: &str, entry: &DialogEntry) -> Result<()> {
        let doc_url = format!("{}/{}/{conversation_id}", self.base_url, self.db_name);
        let response = self
            .http
            .get(&doc_url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| StoreError::Persistence(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Persistence(format!(
                "conversation fetch status={status} body={body}"
            )));
        }

        let mut doc: serde_json::Value = serde_json::from_str(&body)?;
        let dialogs = doc
            .get_mut("dialogs")
            .and_then(serde_json::Value::as_array_mut)
            .ok_or_else(|| {
                StoreError::ResponseFormat("conversation document missing dialogs array".to_string())
            })?;
        dialogs.push(serde_json::to_value(entry)?);

        let response = self
            .http
            .put(&doc_url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&doc)
            .send()
            .await
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Persistence(format!(
                "conversation update status={status} body={body}"
            )));
        }
        Ok(())
    }

    async fn recent_searches_for(&self, user_id: &str, limit: usize) -> Result<Vec<RecentSearch>> {
        let url = format!("{}/{}/_find", self.base_url, self.db_name);
        let query = serde_json::json!({
            "selector": { "date": { "$gt": 0 }, "userId": user_id },
            "sort": [ { "date": "desc" } ],
        });
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&query)
            .send()
            .await
            .map_err(|e| StoreError::Persistence(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Persistence(format!(
                "recent searches status={status} body={body}"
            )));
        }

        let parsed: FindConversationsResponse = serde_json::from_str(&body)?;
        Ok(collect_recent_searches(&parsed.docs, limit))
    }
}

/// Maps logged entry names back to search kinds; non-search entries are
/// skipped.
pub(crate) fn search_kind_for_entry(name: &str) -> Option<SearchKind> {
    match name {
        "search_topic" => Some(SearchKind::Topic),
        "search_speaker" => Some(SearchKind::Speaker),
        "search_artist" => Some(SearchKind::Artist),
        "search_cast" => Some(SearchKind::Cast),
        "search_suggestion" => Some(SearchKind::Suggested),
        _ => None,
    }
}

pub(crate) fn collect_recent_searches(
    docs: &[ConversationDoc],
    limit: usize,
) -> Vec<RecentSearch> {
    let mut searches: Vec<RecentSearch> = Vec::new();
    for doc in docs {
        for dialog in &doc.dialogs {
            if dialog.message.is_empty() {
                continue;
            }
            let Some(kind) = search_kind_for_entry(&dialog.name) else {
                continue;
            };
            let search = RecentSearch {
                kind,
                message: dialog.message.clone(),
            };
            if !searches.contains(&search) {
                searches.push(search);
            }
        }
        if searches.len() >= limit {
            break;
        }
    }
    searches.truncate(limit);
    searches
}

#[derive(Debug, Deserialize)]
struct InsertResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConversationDoc {
    #[serde(default)]
    pub dialogs: Vec<DialogEntry>,
}

#[derive(Debug, Deserialize)]
struct FindConversationsResponse {
    #[serde(default)]
    docs: Vec<ConversationDoc>,
}
