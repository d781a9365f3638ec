//! Backend selection: real HTTP collaborators when configured, in-memory
//! substitutes for local development.

use crate::config::EventFinderConfig;
use crate::orchestrator::Oracle;
use async_trait::async_trait;
use ef_nlu::{ConverseResponse, NluClient};
use ef_stores::{
    DialogStore, EventStore, HttpDialogStore, HttpEventStore, HttpShortener, HttpSmsSender,
    HttpUserStore, MemoryDialogStore, MemoryEventStore, MemorySmsSender, MemoryUserStore,
    SmsSender, UrlShortener, UserStore,
};
use serde_json::{Map, Value};
use std::sync::Arc;

pub struct Backends {
    pub oracle: Arc<dyn Oracle>,
    pub events: Arc<dyn EventStore>,
    pub users: Arc<dyn UserStore>,
    pub dialogs: Arc<dyn DialogStore>,
    pub sms: Arc<dyn SmsSender>,
    pub shortener: Option<Arc<dyn UrlShortener>>,
}

/// Stand-in oracle for runs without a dialog service: every turn falls to
/// the generic handler with an echo line.
#[derive(Default)]
struct DevOracle;

#[async_trait]
impl Oracle for DevOracle {
    async fn converse(
        &self,
        input_text: &str,
        _context: &Map<String, Value>,
    ) -> ef_nlu::Result<ConverseResponse> {
        Ok(ConverseResponse {
            context: Map::new(),
            output: vec![format!(
                "Hi __Name__! No dialog service is configured; you said: {input_text}"
            )],
            entities: Vec::new(),
        })
    }
}

pub fn build_backends(cfg: &EventFinderConfig) -> Backends {
    let oracle: Arc<dyn Oracle> = if cfg.nlu.message_url.trim().is_empty() {
        tracing::warn!("nlu.message_url not set; using the dev echo oracle");
        Arc::new(DevOracle)
    } else {
        Arc::new(NluClient::new(
            &cfg.nlu.message_url,
            &cfg.nlu.username,
            &cfg.nlu.password,
            &cfg.nlu.workspace_id,
        ))
    };

    let (events, users, dialogs): (
        Arc<dyn EventStore>,
        Arc<dyn UserStore>,
        Arc<dyn DialogStore>,
    ) = if cfg.database.url.trim().is_empty() {
        tracing::warn!("database.url not set; using in-memory stores");
        (
            Arc::new(MemoryEventStore::new(Vec::new())),
            Arc::new(MemoryUserStore::new()),
            Arc::new(MemoryDialogStore::new()),
        )
    } else {
        (
            Arc::new(HttpEventStore::new(
                &cfg.database.url,
                &cfg.database.event_db,
                &cfg.database.username,
                &cfg.database.password,
                cfg.search.max_window_hours,
                cfg.search.start_offset_hours,
            )),
            Arc::new(HttpUserStore::new(
                &cfg.database.url,
                &cfg.database.user_db,
                &cfg.database.username,
                &cfg.database.password,
            )),
            Arc::new(HttpDialogStore::new(
                &cfg.database.url,
                &cfg.database.dialog_db,
                &cfg.database.username,
                &cfg.database.password,
            )),
        )
    };

    let sms: Arc<dyn SmsSender> = if cfg.sms.enabled {
        Arc::new(HttpSmsSender::new(
            &cfg.sms.api_base_url,
            &cfg.sms.account_sid,
            &cfg.sms.auth_token,
            &cfg.sms.from_number,
        ))
    } else {
        tracing::warn!("sms disabled; texted links are recorded in memory only");
        Arc::new(MemorySmsSender::new())
    };

    let shortener: Option<Arc<dyn UrlShortener>> = if cfg.shortener.enabled {
        Some(Arc::new(HttpShortener::new(
            &cfg.shortener.shorten_url,
            &cfg.shortener.access_token,
        )))
    } else {
        None
    };

    Backends {
        oracle,
        events,
        users,
        dialogs,
        sms,
        shortener,
    }
}
