//! EventFinder configuration loader.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct EventFinderConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub nlu: NluConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub shortener: ShortenerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Public base URL embedded in shareable result links.
    pub base_url: String,
    /// Name substituted for `__Name__` when the user has not given one.
    #[serde(default = "default_placeholder_name")]
    pub placeholder_name: String,
}

fn default_placeholder_name() -> String {
    "human".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NluConfig {
    #[serde(default)]
    pub message_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub workspace_id: String,
}

/// Cloudant-style document service holding the event, user, and dialog
/// databases. An empty `url` selects the in-memory dev stores.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_event_db")]
    pub event_db: String,
    #[serde(default = "default_user_db")]
    pub user_db: String,
    #[serde(default = "default_dialog_db")]
    pub dialog_db: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            event_db: default_event_db(),
            user_db: default_user_db(),
            dialog_db: default_dialog_db(),
        }
    }
}

fn default_event_db() -> String {
    "events".to_string()
}

fn default_user_db() -> String {
    "users".to_string()
}

fn default_dialog_db() -> String {
    "dialogs".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// First time window tried, in hours; doubled on empty results.
    #[serde(default = "default_initial_window_hours")]
    pub initial_window_hours: u32,
    #[serde(default = "default_max_window_hours")]
    pub max_window_hours: u32,
    /// Offset applied to the window start, for pre-event testing.
    #[serde(default)]
    pub start_offset_hours: i64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_recent_search_limit")]
    pub recent_search_limit: usize,
    /// Seed terms behind the "suggest something" search.
    #[serde(default = "default_suggestion_terms")]
    pub suggestion_terms: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            initial_window_hours: default_initial_window_hours(),
            max_window_hours: default_max_window_hours(),
            start_offset_hours: 0,
            max_results: default_max_results(),
            recent_search_limit: default_recent_search_limit(),
            suggestion_terms: default_suggestion_terms(),
        }
    }
}

fn default_initial_window_hours() -> u32 {
    24
}

fn default_max_window_hours() -> u32 {
    24 * 7
}

fn default_max_results() -> usize {
    5
}

fn default_recent_search_limit() -> usize {
    5
}

fn default_suggestion_terms() -> Vec<String> {
    vec![
        "music".to_string(),
        "film".to_string(),
        "data".to_string(),
    ]
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sms_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub from_number: String,
}

fn default_sms_api_base_url() -> String {
    "https://api.twilio.com".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShortenerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub shorten_url: String,
    #[serde(default)]
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

impl EventFinderConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: EventFinderConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("EVENTFINDER_BASE_URL") {
            if !v.trim().is_empty() {
                self.general.base_url = v;
            }
        }
        if let Ok(v) = std::env::var("NLU_MESSAGE_URL") {
            if !v.trim().is_empty() {
                self.nlu.message_url = v;
            }
        }
        if let Ok(v) = std::env::var("NLU_USERNAME") {
            if !v.trim().is_empty() {
                self.nlu.username = v;
            }
        }
        if let Ok(v) = std::env::var("NLU_PASSWORD") {
            if !v.trim().is_empty() {
                self.nlu.password = v;
            }
        }
        if let Ok(v) = std::env::var("NLU_WORKSPACE_ID") {
            if !v.trim().is_empty() {
                self.nlu.workspace_id = v;
            }
        }
        if let Ok(v) = std::env::var("CLOUDANT_URL") {
            if !v.trim().is_empty() {
                self.database.url = v;
            }
        }
        if let Ok(v) = std::env::var("TWILIO_ACCOUNT_SID") {
            if !v.trim().is_empty() {
                self.sms.account_sid = v;
                self.sms.enabled = true;
            }
        }
        if let Ok(v) = std::env::var("TWILIO_AUTH_TOKEN") {
            if !v.trim().is_empty() {
                self.sms.auth_token = v;
            }
        }
        if let Ok(v) = std::env::var("TWILIO_PHONE_NUMBER") {
            if !v.trim().is_empty() {
                self.sms.from_number = v;
            }
        }
        if let Ok(v) = std::env::var("SHORTENER_ACCESS_TOKEN") {
            if !v.trim().is_empty() {
                self.shortener.access_token = v;
                self.shortener.enabled = true;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("general.base_url is required"));
        }
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be > 0"));
        }
        if !self.nlu.message_url.trim().is_empty() && self.nlu.workspace_id.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "nlu.workspace_id is required when nlu.message_url is set"
            ));
        }
        if self.sms.enabled {
            if self.sms.account_sid.trim().is_empty() || self.sms.auth_token.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "sms.account_sid and sms.auth_token are required when sms is enabled"
                ));
            }
            if self.sms.from_number.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "sms.from_number is required when sms is enabled"
                ));
            }
        }
        if self.shortener.enabled && self.shortener.shorten_url.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "shortener.shorten_url is required when the shortener is enabled"
            ));
        }
        if self.search.initial_window_hours == 0 {
            return Err(anyhow::anyhow!("search.initial_window_hours must be > 0"));
        }
        if self.search.max_window_hours < self.search.initial_window_hours {
            return Err(anyhow::anyhow!(
                "search.max_window_hours must be >= search.initial_window_hours"
            ));
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".eventfinder").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: EventFinderConfig = toml::from_str(
            r#"
[general]
base_url = "http://localhost:3000"
"#,
        )
        .expect("parse minimal config");
        assert_eq!(cfg.general.placeholder_name, "human");
        assert_eq!(cfg.search.initial_window_hours, 24);
        assert_eq!(cfg.search.max_results, 5);
        assert_eq!(cfg.server.port, 3000);
        assert!(!cfg.sms.enabled);
    }

    #[test]
    fn validate_rejects_sms_without_credentials() {
        let mut cfg: EventFinderConfig = toml::from_str(
            r#"
[general]
base_url = "http://localhost:3000"
"#,
        )
        .expect("parse");
        cfg.sms.enabled = true;
        let err = cfg.validate().expect_err("sms without credentials");
        assert!(err.to_string().contains("account_sid"));
    }

    #[test]
    fn validate_rejects_inverted_search_windows() {
        let mut cfg: EventFinderConfig = toml::from_str(
            r#"
[general]
base_url = "http://localhost:3000"
"#,
        )
        .expect("parse");
        cfg.search.initial_window_hours = 48;
        cfg.search.max_window_hours = 24;
        assert!(cfg.validate().is_err());
    }
}
