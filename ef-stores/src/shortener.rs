use crate::error::{Result, StoreError};
use crate::traits::UrlShortener;
use async_trait::async_trait;
use serde::Deserialize;

/// Bitly-style link shortener client.
#[derive(Clone)]
pub struct HttpShortener {
    http: reqwest::Client,
    shorten_url: String,
    access_token: String,
}

impl HttpShortener {
    pub fn new(shorten_url: &str, access_token: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            shorten_url: shorten_url.to_string(),
            access_token: access_token.to_string(),
        }
    }
}

#[async_trait]
impl UrlShortener for HttpShortener {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn shorten(&self, long_url: &str) -> Result<String> {
        let response = self
            .http
            .post(&self.shorten_url)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "long_url": long_url }))
            .send()
            .await
            .map_err(|e| StoreError::Shorten(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Shorten(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Shorten(format!(
                "shorten status={status} body={body}"
            )));
        }

        let parsed: ShortenResponse = serde_json::from_str(&body)?;
        Ok(parsed.link)
    }
}

#[derive(Debug, Deserialize)]
struct ShortenResponse {
    link: String,
}
