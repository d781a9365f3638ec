use crate::error::{NluError, Result};
use crate::types::{ConverseRequest, ConverseResponse, InputText};
use serde_json::{Map, Value};

#[derive(Clone)]
pub struct NluClient {
    http: reqwest::Client,
    message_url: String,
    username: String,
    password: String,
    workspace_id: String,
}

impl NluClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(message_url: &str, username: &str, password: &str, workspace_id: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            message_url: message_url.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            workspace_id: workspace_id.to_string(),
        }
    }

    /// One dialog turn: input text plus the caller's context blob in, the
    /// service's new context blob and output lines back.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn converse(
        &self,
        input_text: &str,
        context: &Map<String, Value>,
    ) -> Result<ConverseResponse> {
        let req = ConverseRequest {
            input: InputText { text: input_text },
            context,
            workspace_id: &self.workspace_id,
        };

        let response = self
            .http
            .post(&self.message_url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(NluError::Http(format!(
                "nlu message status={status} body={body}"
            )));
        }

        let parsed: ConverseResponse = serde_json::from_str(&body)?;
        tracing::debug!(
            action = parsed.action().unwrap_or("<none>"),
            output_lines = parsed.output.len(),
            entities = parsed.entities.len(),
            "nlu turn completed"
        );
        Ok(parsed)
    }
}
