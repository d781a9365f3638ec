use crate::error::{Result, StoreError};
use crate::traits::SmsSender;
use async_trait::async_trait;
use serde::Deserialize;

/// Twilio-style SMS REST client.
#[derive(Clone)]
pub struct HttpSmsSender {
    http: reqwest::Client,
    api_base_url: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl HttpSmsSender {
    pub fn new(api_base_url: &str, account_sid: &str, auth_token: &str, from_number: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            account_sid: account_sid.to_string(),
            auth_token: auth_token.to_string(),
            from_number: from_number.to_string(),
        }
    }
}

#[async_trait]
impl SmsSender for HttpSmsSender {
    #[tracing::instrument(level = "info", skip_all, fields(to_number = to_number))]
    async fn send(&self, to_number: &str, body: &str) -> Result<String> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base_url, self.account_sid
        );
        let form = [
            ("To", to_number),
            ("From", self.from_number.as_str()),
            ("Body", body),
        ];
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| StoreError::Sms(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Sms(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Sms(format!(
                "sms send status={status} body={body}"
            )));
        }

        let parsed: MessageResponse = serde_json::from_str(&body)?;
        tracing::info!(message_sid = %parsed.sid, "sms dispatched");
        Ok(parsed.sid)
    }
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    sid: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_posts_form_and_returns_sid() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/2010-04-01/Accounts/AC123/Messages.json")
                    .body_includes("To=%2B15125551234");
                then.status(201).json_body(json!({ "sid": "SM42" }));
            })
            .await;

        let sender = HttpSmsSender::new(&server.base_url(), "AC123", "secret", "+15550001111");
        let sid = sender
            .send("+15125551234", "hello")
            .await
            .expect("send succeeds");
        mock.assert_async().await;
        assert_eq!(sid, "SM42");
    }

    #[tokio::test]
    async fn provider_rejection_is_an_sms_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/2010-04-01/Accounts/AC123/Messages.json");
                then.status(400).body("{\"message\":\"invalid to\"}");
            })
            .await;

        let sender = HttpSmsSender::new(&server.base_url(), "AC123", "secret", "+15550001111");
        let err = sender.send("bogus", "hello").await.expect_err("400 fails");
        assert!(matches!(err, StoreError::Sms(_)));
    }
}
