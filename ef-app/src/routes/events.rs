use crate::server::AppState;
use axum::extract::Query;
use axum::routing::get;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct EventsQuery {
    /// Comma-separated event ids from a shared results link.
    ids: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/events", get(events))
}

/// Feed behind shared result links: the named events, or the suggested list
/// when no ids were given.
#[tracing::instrument(level = "info", skip_all)]
async fn events(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<serde_json::Value> {
    let result = match query.ids.as_deref().filter(|ids| !ids.is_empty()) {
        Some(ids) => {
            let ids: Vec<String> = ids.split(',').map(str::to_string).collect();
            state.events.events_for_ids(&ids).await
        }
        None => {
            state
                .events
                .suggested(
                    &state.search.suggestion_terms,
                    state.search.initial_window_hours,
                    state.search.max_results,
                )
                .await
        }
    };

    match result {
        Ok(events) => Json(serde_json::json!({ "events": events })),
        Err(e) => {
            tracing::warn!(%e, "events feed lookup failed");
            Json(serde_json::json!({ "events": [], "error": e.to_string() }))
        }
    }
}
