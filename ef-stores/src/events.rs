use crate::error::{Result, StoreError};
use crate::traits::EventStore;
use crate::types::{EventItem, SearchKind};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

const MILLIS_PER_HOUR: i64 = 60 * 60 * 1000;

/// Search-index client against a Cloudant-style lucene search endpoint.
///
/// Every query is date-bounded; when a window produces nothing it is doubled
/// and retried until a hit or `max_window_hours`.
#[derive(Clone)]
pub struct HttpEventStore {
    http: reqwest::Client,
    base_url: String,
    db_name: String,
    username: String,
    password: String,
    max_window_hours: u32,
    start_offset_hours: i64,
}

impl HttpEventStore {
    pub fn new(
        base_url: &str,
        db_name: &str,
        username: &str,
        password: &str,
        max_window_hours: u32,
        start_offset_hours: i64,
    ) -> Self {
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
            max_window_hours,
            start_offset_hours,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(index = index, window_hours = window_hours))]
    async fn find_events(
        &self,
        index: &str,
        query: &str,
        window_hours: u32,
        max_results: usize,
    ) -> Result<Vec<EventItem>> {
        let mut window_hours = window_hours.max(1);
        loop {
            let from = Utc::now().timestamp_millis() + self.start_offset_hours * MILLIS_PER_HOUR;
            let to = from + MILLIS_PER_HOUR * i64::from(window_hours);
            let dated_query = format!("date:[{from} TO {to}] AND ({query})");

            let url = format!(
                "{}/{}/_design/search/_search/{index}",
                self.base_url, self.db_name
            );
            let response = self
                .http
                .get(&url)
                .basic_auth(&self.username, Some(&self.password))
                .query(&[("q", dated_query.as_str()), ("include_docs", "true")])
                .send()
                .await
                .map_err(|e| StoreError::Search(e.to_string()))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| StoreError::Search(e.to_string()))?;
            if !status.is_success() {
                return Err(StoreError::Search(format!(
                    "event search status={status} body={body}"
                )));
            }

            let parsed: SearchResponse = serde_json::from_str(&body)?;
            let mut events: Vec<EventItem> = parsed
                .rows
                .into_iter()
                .filter_map(|row| row.doc)
                .collect();
            if max_results > 0 {
                events.truncate(max_results);
            }

            if !events.is_empty() || window_hours >= self.max_window_hours {
                tracing::debug!(hits = events.len(), window_hours, "event search settled");
                return Ok(events);
            }
            window_hours = (window_hours * 2).min(self.max_window_hours);
        }
    }
}

fn escaped(term: &str) -> String {
    // Lucene query syntax characters in user text would change the query
    // structure; strip the ones Cloudant treats as operators.
    term.chars()
        .filter(|c| !matches!(c, ':' | '(' | ')' | '[' | ']' | '"' | '+' | '-' | '~' | '^'))
        .collect()
}

fn index_and_query(kind: SearchKind, term: &str) -> (&'static str, String) {
    let term = escaped(term);
    match kind {
        SearchKind::Topic => (
            "by_topic",
            format!("name:{term} OR description:{term} OR track:{term} OR tag:{term}"),
        ),
        SearchKind::Speaker => ("by_speaker", format!("speaker:{term}")),
        SearchKind::Artist => ("by_music_artist", format!("artist:{term}")),
        SearchKind::Cast => ("by_film_cast", format!("cast:{term}")),
        SearchKind::Suggested => (
            "by_topic",
            format!("name:{term} OR description:{term} OR track:{term} OR tag:{term}"),
        ),
    }
}

#[async_trait]
impl EventStore for HttpEventStore {
    async fn search(
        &self,
        kind: SearchKind,
        query: &str,
        window_hours: u32,
        max_results: usize,
    ) -> Result<Vec<EventItem>> {
        let (index, q) = index_and_query(kind, query);
        self.find_events(index, &q, window_hours, max_results).await
    }

    async fn suggested(
        &self,
        seed_terms: &[String],
        window_hours: u32,
        max_results: usize,
    ) -> Result<Vec<EventItem>> {
        if seed_terms.is_empty() {
            return Err(StoreError::InvalidInput(
                "suggested search requires at least one seed term".to_string(),
            ));
        }
        let query = seed_terms
            .iter()
            .map(|t| {
                let t = escaped(t);
                format!("(name:{t} OR description:{t} OR track:{t} OR tag:{t})")
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        self.find_events("by_topic", &query, window_hours, max_results)
            .await
    }

    async fn events_for_ids(&self, ids: &[String]) -> Result<Vec<EventItem>> {
        let url = format!("{}/{}/_find", self.base_url, self.db_name);
        let selector = serde_json::json!({ "selector": { "_id": { "$in": ids } } });
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&selector)
            .send()
            .await
            .map_err(|e| StoreError::Search(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Search(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Search(format!(
                "events_for_ids status={status} body={body}"
            )));
        }

        let parsed: FindResponse = serde_json::from_str(&body)?;
        Ok(parsed.docs)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    rows: Vec<SearchRow>,
}

#[derive(Debug, Deserialize)]
struct SearchRow {
    #[serde(default)]
    doc: Option<EventItem>,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    docs: Vec<EventItem>,
}
