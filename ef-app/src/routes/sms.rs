//! Inbound SMS webhook: the phone number is the identity, and a paired
//! browser (remote control) sees the input echoed before the reply lands.

use crate::identity::normalize_phone;
use crate::server::AppState;
use axum::extract::Query;
use axum::routing::get;
use axum::Extension;
use ef_channels::{ReplyPayload, UserId};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct SmsQuery {
    #[serde(rename = "From")]
    from: String,
    #[serde(rename = "Body")]
    body: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/sms", get(inbound_sms))
}

#[tracing::instrument(level = "info", skip_all)]
async fn inbound_sms(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<SmsQuery>,
) -> ([(&'static str, &'static str); 1], String) {
    let identity = UserId::new(normalize_phone(&query.from));
    let primary = state.registry.paired_primary_for(&identity);

    // Input mirrors to the watching channel before the reply does.
    if let Some(ref primary) = primary {
        state
            .registry
            .deliver(
                primary,
                &ReplyPayload::Input {
                    text: query.body.clone(),
                    username: Some(identity.to_string()),
                },
            )
            .await;
    }

    // SMS users are never walked through the name dialog.
    let mut overlay = Map::new();
    overlay.insert("skip_name".to_string(), Value::Bool(true));
    let reply = state
        .orchestrator
        .handle_turn(&identity, &query.body, Some(overlay))
        .await;

    if let Some(ref primary) = primary {
        state.registry.deliver(primary, &reply).await;
    }

    ([("content-type", "text/plain")], render_sms_body(&reply))
}

/// Flattens a reply payload into the plain-text SMS response body.
pub(crate) fn render_sms_body(reply: &ReplyPayload) -> String {
    match reply {
        ReplyPayload::Map { url, .. } => {
            format!("Tap here to see some matching events: {url}")
        }
        ReplyPayload::Searches { searches, .. } => {
            let mut body = String::from("Recent searches:\n");
            for (i, search) in searches.iter().enumerate() {
                body.push_str(&format!("{}. {}: {}\n", i + 1, search.kind, search.message));
            }
            body
        }
        ReplyPayload::Msg { text, .. } | ReplyPayload::Input { text, .. } => text.clone(),
        ReplyPayload::Ping => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{Oracle, Orchestrator, OrchestratorSettings};
    use crate::registry::ChannelRegistry;
    use crate::session::SessionStore;
    use async_trait::async_trait;
    use ef_channels::DeliveryChannel;
    use ef_nlu::ConverseResponse;
    use ef_stores::{
        EventItem, Geometry, MemoryDialogStore, MemoryEventStore, MemorySmsSender,
        MemoryUserStore, RecentSearch, SearchKind,
    };
    use std::time::Instant;
    use tokio::sync::Mutex;

    struct EchoOracle;

    #[async_trait]
    impl Oracle for EchoOracle {
        async fn converse(
            &self,
            input_text: &str,
            _context: &Map<String, Value>,
        ) -> ef_nlu::Result<ConverseResponse> {
            Ok(ConverseResponse {
                context: Map::new(),
                output: vec![format!("You said: {input_text}")],
                entities: Vec::new(),
            })
        }
    }

    struct RecordingChannel {
        id: String,
        sent: Mutex<Vec<ReplyPayload>>,
    }

    #[async_trait]
    impl DeliveryChannel for RecordingChannel {
        fn id(&self) -> &str {
            &self.id
        }

        async fn send(&self, payload: &ReplyPayload) -> anyhow::Result<()> {
            self.sent.lock().await.push(payload.clone());
            Ok(())
        }
    }

    fn test_state() -> Arc<AppState> {
        let users = Arc::new(MemoryUserStore::new());
        let events: Arc<MemoryEventStore> = Arc::new(MemoryEventStore::new(vec![]));
        let sessions = Arc::new(SessionStore::new(users.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorSettings {
                base_url: "http://localhost:3000".to_string(),
                placeholder_name: "human".to_string(),
                initial_window_hours: 24,
                max_results: 5,
                recent_search_limit: 5,
                suggestion_terms: vec!["music".to_string()],
            },
            Arc::new(EchoOracle),
            events.clone(),
            users.clone(),
            Arc::new(MemoryDialogStore::new()),
            Arc::new(MemorySmsSender::new()),
            None,
            sessions,
        ));
        Arc::new(AppState {
            started_at: Instant::now(),
            registry: Arc::new(ChannelRegistry::new()),
            orchestrator,
            events,
            search: crate::config::SearchConfig::default(),
        })
    }

    #[tokio::test]
    async fn paired_sms_turn_mirrors_input_before_reply() {
        let state = test_state();
        let browser = UserId::new("u-browser");
        let channel = Arc::new(RecordingChannel {
            id: "conn-browser".to_string(),
            sent: Mutex::new(Vec::new()),
        });
        state.registry.register(browser.clone(), channel.clone());
        state
            .registry
            .pair(UserId::new("+15125551234"), browser.clone());

        let (_headers, body) = inbound_sms(
            Extension(state.clone()),
            Query(SmsQuery {
                from: "512-555-1234".to_string(),
                body: "jazz".to_string(),
            }),
        )
        .await;
        assert_eq!(body, "You said: jazz\n");

        let sent = channel.sent.lock().await;
        assert_eq!(sent.len(), 2);
        let ReplyPayload::Input { text, username } = &sent[0] else {
            panic!("input echo must arrive before the reply");
        };
        assert_eq!(text, "jazz");
        assert_eq!(username.as_deref(), Some("+15125551234"));
        assert!(matches!(&sent[1], ReplyPayload::Msg { .. }));
    }

    #[tokio::test]
    async fn unpaired_sms_turn_just_returns_the_reply() {
        let state = test_state();
        let (_headers, body) = inbound_sms(
            Extension(state),
            Query(SmsQuery {
                from: "512-555-0000".to_string(),
                body: "hello".to_string(),
            }),
        )
        .await;
        assert_eq!(body, "You said: hello\n");
    }

    #[test]
    fn map_reply_renders_share_link() {
        let reply = ReplyPayload::Map {
            text: "<ul>...</ul>".to_string(),
            username: None,
            points: vec![EventItem {
                id: "e1".to_string(),
                name: "Jazz Brunch".to_string(),
                description: None,
                time_start: None,
                geometry: Some(Geometry {
                    coordinates: vec![-97.7, 30.2],
                }),
            }],
            url: "http://x/events?ids=e1".to_string(),
        };
        assert_eq!(
            render_sms_body(&reply),
            "Tap here to see some matching events: http://x/events?ids=e1"
        );
    }

    #[test]
    fn searches_reply_renders_numbered_list() {
        let reply = ReplyPayload::Searches {
            text: String::new(),
            username: None,
            searches: vec![
                RecentSearch {
                    kind: SearchKind::Topic,
                    message: "jazz".to_string(),
                },
                RecentSearch {
                    kind: SearchKind::Speaker,
                    message: "Ada".to_string(),
                },
            ],
        };
        assert_eq!(
            render_sms_body(&reply),
            "Recent searches:\n1. topic: jazz\n2. speaker: Ada\n"
        );
    }

    #[test]
    fn text_reply_passes_through() {
        let reply = ReplyPayload::Msg {
            text: "Hi there".to_string(),
            username: None,
        };
        assert_eq!(render_sms_body(&reply), "Hi there");
    }
}
