//! The dialog state machine.
//!
//! A turn merges transient context flags into the session context, asks the
//! oracle what to do, dispatches on the returned action, and either replies
//! or chains into a follow-up turn with synthetic input. Any failure inside
//! a turn resets transient state and answers with a fixed apology.

use crate::dialog_log::DialogLog;
use crate::identity::normalize_phone;
use crate::session::{Session, SessionStore};
use async_trait::async_trait;
use chrono::Utc;
use ef_channels::{ReplyPayload, UserId};
use ef_nlu::{ConverseResponse, Entity, NluClient};
use ef_stores::{
    DialogEntry, DialogStore, EventItem, EventStore, SearchKind, SmsSender, UrlShortener, UserStore,
};
use serde_json::{Map, Value};
use std::sync::Arc;

pub const APOLOGY_REPLY: &str = "Sorry, something went wrong! Say anything to me to start over...";

/// Upper bound on "move to next dialog" chaining inside one user-visible
/// turn. The dialog definitions never need more than two hops; anything
/// deeper is a misconfigured workspace looping on itself.
const MAX_CHAIN_HOPS: usize = 3;

/// The NLU dialog service seam, mockable in tests.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn converse(
        &self,
        input_text: &str,
        context: &Map<String, Value>,
    ) -> ef_nlu::Result<ConverseResponse>;
}

#[async_trait]
impl Oracle for NluClient {
    async fn converse(
        &self,
        input_text: &str,
        context: &Map<String, Value>,
    ) -> ef_nlu::Result<ConverseResponse> {
        NluClient::converse(self, input_text, context).await
    }
}

/// Closed set of oracle actions. Anything else falls back to the generic
/// greeting handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    StartSearch,
    StartOver,
    GetName,
    GetTopic,
    SearchTopic,
    GetSpeaker,
    SearchSpeaker,
    GetArtist,
    SearchArtist,
    GetCast,
    SearchCast,
    SearchSuggestion,
    RecentSearches,
    SelectSearch,
    GetPhoneNumber,
    Text,
    FinishNoText,
    Unrecognized,
}

impl Action {
    fn parse(value: &str) -> Self {
        match value {
            "start_search" => Self::StartSearch,
            "start_over" => Self::StartOver,
            "get_name" => Self::GetName,
            "get_topic" => Self::GetTopic,
            "search_topic" => Self::SearchTopic,
            "get_speaker" => Self::GetSpeaker,
            "search_speaker" => Self::SearchSpeaker,
            "get_artist" => Self::GetArtist,
            "search_artist" => Self::SearchArtist,
            "get_cast" => Self::GetCast,
            "search_cast" => Self::SearchCast,
            "search_suggestion" => Self::SearchSuggestion,
            "recent_searches" => Self::RecentSearches,
            "select_search" => Self::SelectSearch,
            "get_phone_number" => Self::GetPhoneNumber,
            "text" => Self::Text,
            "finish_no_text" => Self::FinishNoText,
            _ => Self::Unrecognized,
        }
    }

    /// Name stamped on the dialog-log entry for this action.
    fn log_name(&self) -> &'static str {
        match self {
            Self::StartSearch | Self::Unrecognized => "start",
            Self::StartOver => "start_over",
            Self::GetName => "get_name",
            Self::GetTopic => "get_topic",
            Self::SearchTopic => "search_topic",
            Self::GetSpeaker => "get_speaker",
            Self::SearchSpeaker => "search_speaker",
            Self::GetArtist => "get_artist",
            Self::SearchArtist => "search_artist",
            Self::GetCast => "get_cast",
            Self::SearchCast => "search_cast",
            Self::SearchSuggestion => "search_suggestion",
            Self::RecentSearches => "recent_searches",
            Self::SelectSearch => "select_search",
            Self::GetPhoneNumber => "get_phone_number",
            Self::Text => "text",
            Self::FinishNoText => "finish_no_text",
        }
    }

    /// Whether this action opens a new logged conversation.
    fn starts_conversation(&self) -> bool {
        matches!(self, Self::StartSearch | Self::StartOver | Self::Unrecognized)
    }
}

fn search_log_name(kind: SearchKind) -> &'static str {
    match kind {
        SearchKind::Topic => "search_topic",
        SearchKind::Speaker => "search_speaker",
        SearchKind::Artist => "search_artist",
        SearchKind::Cast => "search_cast",
        SearchKind::Suggested => "search_suggestion",
    }
}

/// What a handler produced: a finished reply, or a synthetic re-entry into
/// the oracle ("move to next dialog").
enum HandlerOutcome {
    Done { reply: ReplyPayload, restart: bool },
    Continue { input: String, overlay: Map<String, Value> },
}

fn continue_with_flag(input: &str, flag: &str) -> HandlerOutcome {
    let mut overlay = Map::new();
    overlay.insert(flag.to_string(), Value::Bool(true));
    HandlerOutcome::Continue {
        input: input.to_string(),
        overlay,
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub base_url: String,
    pub placeholder_name: String,
    pub initial_window_hours: u32,
    pub max_results: usize,
    pub recent_search_limit: usize,
    pub suggestion_terms: Vec<String>,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    oracle: Arc<dyn Oracle>,
    events: Arc<dyn EventStore>,
    users: Arc<dyn UserStore>,
    dialogs: Arc<dyn DialogStore>,
    sms: Arc<dyn SmsSender>,
    shortener: Option<Arc<dyn UrlShortener>>,
    sessions: Arc<SessionStore>,
    log: DialogLog,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: OrchestratorSettings,
        oracle: Arc<dyn Oracle>,
        events: Arc<dyn EventStore>,
        users: Arc<dyn UserStore>,
        dialogs: Arc<dyn DialogStore>,
        sms: Arc<dyn SmsSender>,
        shortener: Option<Arc<dyn UrlShortener>>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        let log = DialogLog::new(dialogs.clone());
        Self {
            settings,
            oracle,
            events,
            users,
            dialogs,
            sms,
            shortener,
            sessions,
            log,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// One inbound-to-reply cycle. Never fails: any error inside the turn
    /// resets transient state and becomes the apology reply.
    #[tracing::instrument(level = "info", skip_all, fields(user_id = %user_id))]
    pub async fn handle_turn(
        &self,
        user_id: &UserId,
        input_text: &str,
        overlay: Option<Map<String, Value>>,
    ) -> ReplyPayload {
        match self.run_turn(user_id, input_text, overlay).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(%e, user_id = %user_id, "turn failed; resetting transient state");
                if let Some(session) = self.sessions.get(user_id) {
                    session.clear().await;
                }
                ReplyPayload::Msg {
                    text: APOLOGY_REPLY.to_string(),
                    username: None,
                }
            }
        }
    }

    async fn run_turn(
        &self,
        user_id: &UserId,
        input_text: &str,
        overlay: Option<Map<String, Value>>,
    ) -> anyhow::Result<ReplyPayload> {
        let session = self.sessions.get_or_create(user_id).await?;

        let mut input = input_text.to_string();
        let mut overlay = overlay.unwrap_or_default();
        {
            let state = session.state.lock().await;
            if state.username.is_some() {
                overlay.insert("returning_user".to_string(), Value::Bool(true));
            }
        }

        for hop in 0..=MAX_CHAIN_HOPS {
            let context = {
                let mut state = session.state.lock().await;
                for (key, value) in &overlay {
                    state.context.insert(key.clone(), value.clone());
                }
                state.context.clone()
            };

            let response = self.oracle.converse(&input, &context).await?;
            {
                // The oracle's context replaces ours wholesale; the next
                // hop's overlay is merged on top of it.
                let mut state = session.state.lock().await;
                state.context = response.context.clone();
            }

            let action = Action::parse(response.action().unwrap_or("start_search"));
            tracing::debug!(action = action.log_name(), hop, "dispatching oracle action");

            match self.dispatch(action, &session, &response, &input).await? {
                HandlerOutcome::Done { mut reply, restart } => {
                    self.finish_reply(&session, &mut reply).await;
                    if restart {
                        session.clear().await;
                    }
                    return Ok(reply);
                }
                HandlerOutcome::Continue {
                    input: next_input,
                    overlay: next_overlay,
                } => {
                    input = next_input;
                    overlay = next_overlay;
                }
            }
        }

        Err(anyhow::anyhow!(
            "dialog continuation depth exceeded ({MAX_CHAIN_HOPS} hops)"
        ))
    }

    async fn dispatch(
        &self,
        action: Action,
        session: &Arc<Session>,
        response: &ConverseResponse,
        input: &str,
    ) -> anyhow::Result<HandlerOutcome> {
        match action {
            Action::StartSearch | Action::Unrecognized => {
                self.log_turn(session, &action, input);
                Ok(plain_reply(response, false))
            }
            Action::StartOver => {
                self.log_turn(session, &action, input);
                Ok(plain_reply(response, true))
            }
            Action::GetName => self.handle_get_name(session, response, input).await,
            Action::GetTopic
            | Action::GetSpeaker
            | Action::GetArtist
            | Action::GetCast
            | Action::GetPhoneNumber => {
                self.log_turn(session, &action, input);
                Ok(plain_reply(response, false))
            }
            Action::FinishNoText => {
                self.log_turn(session, &action, input);
                Ok(plain_reply(response, true))
            }
            Action::SearchTopic => self.run_search(session, SearchKind::Topic, input).await,
            Action::SearchSpeaker => self.run_search(session, SearchKind::Speaker, input).await,
            Action::SearchArtist => self.run_search(session, SearchKind::Artist, input).await,
            Action::SearchCast => self.run_search(session, SearchKind::Cast, input).await,
            Action::SearchSuggestion => {
                self.run_search(session, SearchKind::Suggested, input).await
            }
            Action::RecentSearches => self.handle_recent_searches(session, response, input).await,
            Action::SelectSearch => self.handle_select_search(session, response, input).await,
            Action::Text => self.handle_text_me(session, response, input).await,
        }
    }

    fn log_turn(&self, session: &Arc<Session>, action: &Action, message: &str) {
        self.log.enqueue(
            session,
            DialogEntry {
                name: action.log_name().to_string(),
                message: message.to_string(),
                date: Utc::now(),
                new_conversation: action.starts_conversation(),
            },
        );
    }

    fn log_search(&self, session: &Arc<Session>, kind: SearchKind, term: &str) {
        self.log.enqueue(
            session,
            DialogEntry {
                name: search_log_name(kind).to_string(),
                message: term.to_string(),
                date: Utc::now(),
                new_conversation: false,
            },
        );
    }

    /// Name capture: the store write must succeed before the session learns
    /// the name.
    async fn handle_get_name(
        &self,
        session: &Arc<Session>,
        response: &ConverseResponse,
        input: &str,
    ) -> anyhow::Result<HandlerOutcome> {
        self.log_turn(session, &Action::GetName, input);
        let name = input.trim();
        self.users.set_name(session.user_id.as_str(), name).await?;
        session.state.lock().await.username = Some(name.to_string());
        Ok(plain_reply(response, false))
    }

    /// Topic/speaker/artist/cast/suggestion search. Results without
    /// coordinates cannot be mapped and are dropped; an empty remainder
    /// chains into the no-results dialog branch instead of replying empty.
    async fn run_search(
        &self,
        session: &Arc<Session>,
        kind: SearchKind,
        term: &str,
    ) -> anyhow::Result<HandlerOutcome> {
        self.log_search(session, kind, term);

        let events = match kind {
            SearchKind::Suggested => {
                self.events
                    .suggested(
                        &self.settings.suggestion_terms,
                        self.settings.initial_window_hours,
                        self.settings.max_results,
                    )
                    .await?
            }
            _ => {
                self.events
                    .search(
                        kind,
                        term,
                        self.settings.initial_window_hours,
                        self.settings.max_results,
                    )
                    .await?
            }
        };

        let mappable: Vec<EventItem> = events
            .into_iter()
            .filter(EventItem::has_coordinates)
            .collect();
        tracing::debug!(kind = %kind, hits = mappable.len(), "search handler settled");

        if mappable.is_empty() {
            return Ok(continue_with_flag(term, "search_no_results"));
        }

        let mut text = String::from("<b>Here is a list of events happening today:</b><br/><ul>");
        for event in &mappable {
            text.push_str("<li>");
            text.push_str(&event.name);
            text.push_str("</li>");
        }
        text.push_str("</ul><p>Would you like me to text you the results?</p>");

        let url = share_url(&self.settings.base_url, &mappable);
        {
            let mut state = session.state.lock().await;
            state.last_results = mappable.clone();
            state.last_share_url = Some(url.clone());
        }

        Ok(HandlerOutcome::Done {
            reply: ReplyPayload::Map {
                text,
                username: None,
                points: mappable,
                url,
            },
            restart: false,
        })
    }

    async fn handle_recent_searches(
        &self,
        session: &Arc<Session>,
        response: &ConverseResponse,
        input: &str,
    ) -> anyhow::Result<HandlerOutcome> {
        self.log_turn(session, &Action::RecentSearches, input);
        let searches = self
            .dialogs
            .recent_searches_for(session.user_id.as_str(), self.settings.recent_search_limit)
            .await?;
        session.state.lock().await.recent_searches = searches.clone();

        Ok(HandlerOutcome::Done {
            reply: ReplyPayload::Searches {
                text: response.output_text(),
                username: None,
                searches,
            },
            restart: false,
        })
    }

    /// Re-dispatches a prior search chosen by 1-based index.
    async fn handle_select_search(
        &self,
        session: &Arc<Session>,
        response: &ConverseResponse,
        input: &str,
    ) -> anyhow::Result<HandlerOutcome> {
        self.log_turn(session, &Action::SelectSearch, input);

        let selected = {
            let state = session.state.lock().await;
            selection_index(&response.entities)
                .filter(|index| (1..=state.recent_searches.len()).contains(index))
                .map(|index| state.recent_searches[index - 1].clone())
        };
        let Some(search) = selected else {
            return Ok(continue_with_flag(input, "invalid_selection"));
        };

        self.run_search(session, search.kind, &search.message).await
    }

    /// "Text me the results": normalize the destination, build the share
    /// link, optionally shorten it, send the SMS. Send failures fail the
    /// turn.
    async fn handle_text_me(
        &self,
        session: &Arc<Session>,
        response: &ConverseResponse,
        input: &str,
    ) -> anyhow::Result<HandlerOutcome> {
        self.log_turn(session, &Action::Text, input);

        let phone_number = normalize_phone(input);
        let long_url = {
            let state = session.state.lock().await;
            state
                .last_share_url
                .clone()
                .unwrap_or_else(|| format!("{}/events", self.settings.base_url))
        };
        let url = match &self.shortener {
            Some(shortener) => shortener.shorten(&long_url).await?,
            None => long_url,
        };

        self.sms.send(&phone_number, &url).await?;
        tracing::info!(to_number = %phone_number, "results link texted");
        Ok(plain_reply(response, true))
    }

    /// Fills the username field and substitutes every `__Name__` token.
    async fn finish_reply(&self, session: &Arc<Session>, reply: &mut ReplyPayload) {
        let state = session.state.lock().await;
        let display_name = state
            .username
            .clone()
            .unwrap_or_else(|| self.settings.placeholder_name.clone());

        match reply {
            ReplyPayload::Msg { text, username }
            | ReplyPayload::Map { text, username, .. }
            | ReplyPayload::Searches { text, username, .. }
            | ReplyPayload::Input { text, username } => {
                *text = text.replace("__Name__", &display_name);
                *username = state.username.clone();
            }
            ReplyPayload::Ping => {}
        }
    }
}

fn plain_reply(response: &ConverseResponse, restart: bool) -> HandlerOutcome {
    HandlerOutcome::Done {
        reply: ReplyPayload::Msg {
            text: response.output_text(),
            username: None,
        },
        restart,
    }
}

/// Shareable URL embedding the result ids, comma-separated and
/// percent-encoded the way the events page expects them.
fn share_url(base_url: &str, events: &[EventItem]) -> String {
    let ids = events
        .iter()
        .map(|e| e.id.as_str())
        .collect::<Vec<_>>()
        .join("%2C");
    format!("{base_url}/events?ids={ids}")
}

/// First oracle entity that parses as a 1-based list index.
fn selection_index(entities: &[Entity]) -> Option<usize> {
    entities.iter().find_map(|e| e.value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ef_stores::{
        Geometry, MemoryDialogStore, MemoryEventStore, MemorySmsSender, MemoryUserStore,
        RecentSearch,
    };
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct ScriptedOracle {
        responses: Mutex<VecDeque<ConverseResponse>>,
        calls: Mutex<Vec<(String, Map<String, Value>)>>,
    }

    impl ScriptedOracle {
        fn new(responses: Vec<ConverseResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        async fn calls(&self) -> Vec<(String, Map<String, Value>)> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl Oracle for ScriptedOracle {
        async fn converse(
            &self,
            input_text: &str,
            context: &Map<String, Value>,
        ) -> ef_nlu::Result<ConverseResponse> {
            self.calls
                .lock()
                .await
                .push((input_text.to_string(), context.clone()));
            let mut responses = self.responses.lock().await;
            match responses.pop_front() {
                Some(response) => Ok(response),
                None => Err(ef_nlu::NluError::Http("script exhausted".to_string())),
            }
        }
    }

    fn oracle_response(action: Option<&str>, lines: &[&str]) -> ConverseResponse {
        let mut context = Map::new();
        if let Some(action) = action {
            context.insert("action".to_string(), json!(action));
        }
        ConverseResponse {
            context,
            output: lines.iter().map(|s| s.to_string()).collect(),
            entities: Vec::new(),
        }
    }

    fn with_entity(mut response: ConverseResponse, entity: &str, value: &str) -> ConverseResponse {
        response.entities.push(Entity {
            entity: entity.to_string(),
            value: value.to_string(),
        });
        response
    }

    fn event(id: &str, name: &str, mappable: bool) -> EventItem {
        EventItem {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            time_start: None,
            geometry: mappable.then(|| Geometry {
                coordinates: vec![-97.74, 30.26],
            }),
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        oracle: Arc<ScriptedOracle>,
        dialogs: Arc<MemoryDialogStore>,
        sms: Arc<MemorySmsSender>,
        users: Arc<MemoryUserStore>,
    }

    fn fixture(responses: Vec<ConverseResponse>, events: Vec<EventItem>) -> Fixture {
        fixture_with(
            responses,
            Arc::new(MemoryEventStore::new(events)),
            Arc::new(MemoryDialogStore::new()),
            Arc::new(MemoryUserStore::new()),
        )
    }

    fn fixture_with(
        responses: Vec<ConverseResponse>,
        events: Arc<MemoryEventStore>,
        dialogs: Arc<MemoryDialogStore>,
        users: Arc<MemoryUserStore>,
    ) -> Fixture {
        let oracle = Arc::new(ScriptedOracle::new(responses));
        let sms = Arc::new(MemorySmsSender::new());
        let sessions = Arc::new(SessionStore::new(users.clone()));
        let settings = OrchestratorSettings {
            base_url: "http://localhost:3000".to_string(),
            placeholder_name: "human".to_string(),
            initial_window_hours: 24,
            max_results: 5,
            recent_search_limit: 5,
            suggestion_terms: vec!["music".to_string()],
        };
        let orchestrator = Orchestrator::new(
            settings,
            oracle.clone(),
            events,
            users.clone(),
            dialogs.clone(),
            sms.clone(),
            None,
            sessions,
        );
        Fixture {
            orchestrator,
            oracle,
            dialogs,
            sms,
            users,
        }
    }

    #[tokio::test]
    async fn default_action_runs_generic_handler_and_opens_conversation() {
        let fx = fixture(
            vec![oracle_response(None, &["Hi there!", "What can I find for you?"])],
            vec![],
        );
        let user = UserId::new("u-first");

        let reply = fx.orchestrator.handle_turn(&user, "hello", None).await;
        let ReplyPayload::Msg { text, username } = reply else {
            panic!("expected text reply");
        };
        assert_eq!(text, "Hi there!\nWhat can I find for you?\n");
        assert!(username.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.dialogs.call_log().await, vec!["create:start"]);
    }

    #[tokio::test]
    async fn unknown_action_falls_back_to_generic_handler() {
        let fx = fixture(
            vec![oracle_response(Some("dance_party"), &["Let's start over."])],
            vec![],
        );
        let user = UserId::new("u-unknown-action");

        let reply = fx.orchestrator.handle_turn(&user, "??", None).await;
        assert_eq!(reply.text(), Some("Let's start over.\n"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Logged like a conversation opener, not dropped.
        assert_eq!(fx.dialogs.call_log().await, vec!["create:start"]);
    }

    #[tokio::test]
    async fn reply_does_not_wait_for_slow_persistence() {
        let dialogs = Arc::new(MemoryDialogStore::with_latency(Duration::from_millis(300)));
        let fx = fixture_with(
            vec![oracle_response(None, &["Hello!"])],
            Arc::new(MemoryEventStore::new(vec![])),
            dialogs.clone(),
            Arc::new(MemoryUserStore::new()),
        );
        let user = UserId::new("u-slow-log");

        let started = std::time::Instant::now();
        let reply = fx.orchestrator.handle_turn(&user, "hi", None).await;
        assert!(matches!(reply, ReplyPayload::Msg { .. }));
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(dialogs.entry_count().await, 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(dialogs.call_log().await, vec!["create:start"]);
    }

    #[tokio::test]
    async fn search_with_geometry_returns_map_reply_and_caches_results() {
        let fx = fixture(
            vec![oracle_response(Some("search_topic"), &[])],
            vec![event("e1", "Jazz Brunch", true), event("e2", "Jazz Jam", true)],
        );
        let user = UserId::new("u-search");

        let reply = fx.orchestrator.handle_turn(&user, "jazz", None).await;
        let ReplyPayload::Map { text, points, url, .. } = reply else {
            panic!("expected map reply");
        };
        assert!(text.contains("<li>Jazz Brunch</li>"));
        assert!(text.contains("Would you like me to text you the results?"));
        assert_eq!(points.len(), 2);
        assert_eq!(url, "http://localhost:3000/events?ids=e1%2Ce2");

        let session = fx
            .orchestrator
            .sessions()
            .get(&user)
            .expect("session exists");
        let state = session.state.lock().await;
        assert_eq!(state.last_results.len(), 2);
        assert_eq!(state.last_share_url.as_deref(), Some(url.as_str()));
    }

    #[tokio::test]
    async fn geometry_less_results_chain_into_no_results_branch() {
        let fx = fixture(
            vec![
                oracle_response(Some("search_topic"), &[]),
                oracle_response(None, &["No luck; try a speaker instead?"]),
            ],
            // A hit that cannot be mapped: filtered out, leaving zero.
            vec![event("a", "jazz night", false)],
        );
        let user = UserId::new("u-noresults");

        let reply = fx.orchestrator.handle_turn(&user, "jazz", None).await;
        let ReplyPayload::Msg { text, .. } = reply else {
            panic!("expected text reply from fallback branch");
        };
        assert_eq!(text, "No luck; try a speaker instead?\n");

        let calls = fx.oracle.calls().await;
        assert_eq!(calls.len(), 2);
        // Second hop re-enters the oracle with the no-results flag merged in.
        assert_eq!(calls[1].0, "jazz");
        assert_eq!(calls[1].1.get("search_no_results"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn same_term_replies_differ_with_and_without_geometry() {
        let mappable = fixture(
            vec![oracle_response(Some("search_topic"), &[])],
            vec![event("a", "jazz night", true)],
        );
        let unmappable = fixture(
            vec![
                oracle_response(Some("search_topic"), &[]),
                oracle_response(None, &["Nothing mappable."]),
            ],
            vec![event("a", "jazz night", false)],
        );
        let user = UserId::new("u-compare");

        let with_geometry = mappable.orchestrator.handle_turn(&user, "jazz", None).await;
        let without_geometry = unmappable.orchestrator.handle_turn(&user, "jazz", None).await;

        assert!(matches!(with_geometry, ReplyPayload::Map { .. }));
        assert!(matches!(without_geometry, ReplyPayload::Msg { .. }));
    }

    #[tokio::test]
    async fn recent_search_selection_dispatches_matching_handler() {
        let fx = fixture(
            vec![with_entity(
                oracle_response(Some("select_search"), &[]),
                "selection",
                "2",
            )],
            vec![event("e9", "Ada Lovelace Keynote", true)],
        );
        let user = UserId::new("u-select");

        // Simulate an earlier recent-searches listing.
        let session = fx
            .orchestrator
            .sessions()
            .get_or_create(&user)
            .await
            .expect("session");
        session.state.lock().await.recent_searches = vec![
            RecentSearch {
                kind: SearchKind::Topic,
                message: "jazz".to_string(),
            },
            RecentSearch {
                kind: SearchKind::Speaker,
                message: "Ada".to_string(),
            },
        ];

        let reply = fx.orchestrator.handle_turn(&user, "2", None).await;
        let ReplyPayload::Map { points, .. } = reply else {
            panic!("expected map reply from re-dispatched speaker search");
        };
        assert_eq!(points[0].name, "Ada Lovelace Keynote");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let log = fx.dialogs.call_log().await;
        assert!(log.contains(&"create:select_search".to_string()));
        assert!(log.contains(&"append:search_speaker".to_string()));
    }

    #[tokio::test]
    async fn out_of_range_selection_chains_with_invalid_flag() {
        let fx = fixture(
            vec![
                with_entity(oracle_response(Some("select_search"), &[]), "selection", "5"),
                oracle_response(None, &["That's not one of your searches."]),
            ],
            vec![],
        );
        let user = UserId::new("u-badselect");

        let session = fx
            .orchestrator
            .sessions()
            .get_or_create(&user)
            .await
            .expect("session");
        session.state.lock().await.recent_searches = vec![RecentSearch {
            kind: SearchKind::Topic,
            message: "jazz".to_string(),
        }];

        let reply = fx.orchestrator.handle_turn(&user, "5", None).await;
        assert_eq!(
            reply.text(),
            Some("That's not one of your searches.\n")
        );
        let calls = fx.oracle.calls().await;
        assert_eq!(calls[1].1.get("invalid_selection"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn name_capture_persists_before_applying_locally() {
        let fx = fixture(
            vec![
                oracle_response(Some("get_name"), &["Nice to meet you, __Name__!"]),
            ],
            vec![],
        );
        let user = UserId::new("u-name");

        let reply = fx.orchestrator.handle_turn(&user, "Grace", None).await;
        assert_eq!(reply.text(), Some("Nice to meet you, Grace!\n"));

        let record = fx
            .users
            .get_by_id("u-name")
            .await
            .expect("lookup")
            .expect("record");
        assert_eq!(record.name.as_deref(), Some("Grace"));
    }

    #[tokio::test]
    async fn failed_name_write_fails_turn_and_leaves_username_unset() {
        let fx = fixture_with(
            vec![oracle_response(Some("get_name"), &["Hi __Name__!"])],
            Arc::new(MemoryEventStore::new(vec![])),
            Arc::new(MemoryDialogStore::new()),
            Arc::new(MemoryUserStore::failing_writes()),
        );
        let user = UserId::new("u-name-fail");

        let reply = fx.orchestrator.handle_turn(&user, "Grace", None).await;
        assert_eq!(reply.text(), Some(APOLOGY_REPLY));

        let session = fx
            .orchestrator
            .sessions()
            .get(&user)
            .expect("session exists");
        assert!(session.state.lock().await.username.is_none());
    }

    #[tokio::test]
    async fn name_placeholder_substitutes_every_occurrence() {
        let fx = fixture(
            vec![oracle_response(
                Some("get_topic"),
                &["__Name__, what topic?", "Anything goes, __Name__."],
            )],
            vec![],
        );
        let user = UserId::new("u-placeholder");

        let reply = fx.orchestrator.handle_turn(&user, "topics", None).await;
        assert_eq!(
            reply.text(),
            Some("human, what topic?\nAnything goes, human.\n")
        );
    }

    #[tokio::test]
    async fn text_me_normalizes_number_and_sends_share_link() {
        let fx = fixture(
            vec![
                oracle_response(Some("search_topic"), &[]),
                oracle_response(Some("text"), &["Sent! Talk soon."]),
            ],
            vec![event("e1", "Jazz Brunch", true)],
        );
        let user = UserId::new("u-textme");

        let first = fx.orchestrator.handle_turn(&user, "jazz", None).await;
        assert!(matches!(first, ReplyPayload::Map { .. }));

        let second = fx
            .orchestrator
            .handle_turn(&user, "512-555-1234", None)
            .await;
        assert_eq!(second.text(), Some("Sent! Talk soon.\n"));

        let sent = fx.sms.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "+15125551234");
        assert_eq!(sent[0].1, "http://localhost:3000/events?ids=e1");

        // Successful text ends the conversation: transient state is gone.
        let session = fx
            .orchestrator
            .sessions()
            .get(&user)
            .expect("session exists");
        let state = session.state.lock().await;
        assert!(state.context.is_empty());
        assert!(state.last_results.is_empty());
    }

    #[tokio::test]
    async fn sms_failure_becomes_apology() {
        let mut fx = fixture(
            vec![
                oracle_response(Some("search_topic"), &[]),
                oracle_response(Some("text"), &["Sent!"]),
            ],
            vec![event("e1", "Jazz Brunch", true)],
        );
        fx.orchestrator.sms = Arc::new(MemorySmsSender::failing());
        let user = UserId::new("u-smsfail");

        fx.orchestrator.handle_turn(&user, "jazz", None).await;
        let reply = fx
            .orchestrator
            .handle_turn(&user, "512-555-1234", None)
            .await;
        assert_eq!(reply.text(), Some(APOLOGY_REPLY));
    }

    #[tokio::test]
    async fn oracle_failure_resets_context_and_apologizes() {
        let fx = fixture(vec![], vec![]);
        let user = UserId::new("u-oracle-down");

        let reply = fx.orchestrator.handle_turn(&user, "hello", None).await;
        assert_eq!(reply.text(), Some(APOLOGY_REPLY));

        let session = fx
            .orchestrator
            .sessions()
            .get(&user)
            .expect("session exists");
        assert!(session.state.lock().await.context.is_empty());
    }

    #[tokio::test]
    async fn endless_continuation_is_cut_off_by_depth_cap() {
        // Oracle keeps answering search_topic with nothing to find.
        let fx = fixture(
            vec![
                oracle_response(Some("search_topic"), &[]),
                oracle_response(Some("search_topic"), &[]),
                oracle_response(Some("search_topic"), &[]),
                oracle_response(Some("search_topic"), &[]),
                oracle_response(Some("search_topic"), &[]),
            ],
            vec![],
        );
        let user = UserId::new("u-loop");

        let reply = fx.orchestrator.handle_turn(&user, "jazz", None).await;
        assert_eq!(reply.text(), Some(APOLOGY_REPLY));
        assert_eq!(fx.oracle.calls().await.len(), 1 + MAX_CHAIN_HOPS);
    }

    #[tokio::test]
    async fn skip_name_overlay_reaches_oracle_context() {
        let fx = fixture(vec![oracle_response(None, &["Hi!"])], vec![]);
        let user = UserId::new("u-sms-origin");

        let mut overlay = Map::new();
        overlay.insert("skip_name".to_string(), json!(true));
        fx.orchestrator
            .handle_turn(&user, "hello", Some(overlay))
            .await;

        let calls = fx.oracle.calls().await;
        assert_eq!(calls[0].1.get("skip_name"), Some(&json!(true)));
        assert!(calls[0].1.get("returning_user").is_none());
    }

    #[tokio::test]
    async fn returning_user_flag_injected_when_username_known() {
        let users = Arc::new(MemoryUserStore::new());
        users
            .insert(ef_stores::UserRecord {
                id: "u-returning".to_string(),
                token: None,
                name: Some("Ada".to_string()),
            })
            .await;
        let fx = fixture_with(
            vec![oracle_response(None, &["Welcome back, __Name__!"])],
            Arc::new(MemoryEventStore::new(vec![])),
            Arc::new(MemoryDialogStore::new()),
            users,
        );
        let user = UserId::new("u-returning");

        let reply = fx.orchestrator.handle_turn(&user, "hi", None).await;
        assert_eq!(reply.text(), Some("Welcome back, Ada!\n"));
        let ReplyPayload::Msg { username, .. } = reply else {
            unreachable!()
        };
        assert_eq!(username.as_deref(), Some("Ada"));

        let calls = fx.oracle.calls().await;
        assert_eq!(calls[0].1.get("returning_user"), Some(&json!(true)));
    }
}
