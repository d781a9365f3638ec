use crate::error::{Result, StoreError};
use crate::traits::UserStore;
use crate::types::UserRecord;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

/// User-profile client against a Cloudant-style document API.
#[derive(Clone)]
pub struct HttpUserStore {
    http: reqwest::Client,
    base_url: String,
    db_name: String,
    username: String,
    password: String,
}

impl HttpUserStore {
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

    fn doc_url(&self, id: &str) -> String {
        format!("{}/{}/{id}", self.base_url, self.db_name)
    }

    async fn fetch_doc(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let response = self
            .http
            .get(self.doc_url(id))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| StoreError::Persistence(e.to_string()))?;

        // Unknown user is an absent profile, not an error.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Persistence(format!(
                "user fetch status={status} body={body}"
            )));
        }
        Ok(Some(serde_json::from_str(&body)?))
    }

    async fn put_doc(&self, id: &str, doc: &serde_json::Value) -> Result<()> {
        let response = self
            .http
            .put(self.doc_url(id))
            .basic_auth(&self.username, Some(&self.password))
            .json(doc)
            .send()
            .await
            .map_err(|e| StoreError::Persistence(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Persistence(format!(
                "user write status={status} body={body}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for HttpUserStore {
    async fn get_by_id(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let Some(doc) = self.fetch_doc(user_id).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(doc)?))
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<UserRecord>> {
        let url = format!("{}/{}/_find", self.base_url, self.db_name);
        let selector = serde_json::json!({ "selector": { "token": token } });
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&selector)
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
                "user token lookup status={status} body={body}"
            )));
        }

        let parsed: FindUsersResponse = serde_json::from_str(&body)?;
        Ok(parsed.docs.into_iter().next())
    }

    async fn create(&self, user_id: &str, token: &str) -> Result<UserRecord> {
        let doc = serde_json::json!({
            "_id": user_id,
            "token": token,
            "date": Utc::now().timestamp_millis(),
        });
        self.put_doc(user_id, &doc).await?;
        Ok(UserRecord {
            id: user_id.to_string(),
            token: Some(token.to_string()),
            name: None,
        })
    }

    async fn set_name(&self, user_id: &str, name: &str) -> Result<()> {
        let Some(mut doc) = self.fetch_doc(user_id).await? else {
            // Matches the original store: a missing profile makes the name
            // write a no-op rather than a failure.
            return Ok(());
        };
        doc["name"] = serde_json::Value::String(name.to_string());
        self.put_doc(user_id, &doc).await
    }
}

#[derive(Debug, Deserialize)]
struct FindUsersResponse {
    #[serde(default)]
    docs: Vec<UserRecord>,
}
