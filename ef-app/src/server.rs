//! EventFinder server: HTTP surface, WebSocket channel, gateway startup,
//! graceful shutdown.

use crate::config::{EventFinderConfig, SearchConfig};
use crate::dev_backends;
use crate::gateway::Gateway;
use crate::identity::IdentityResolver;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::registry::ChannelRegistry;
use crate::routes;
use crate::session::SessionStore;
use anyhow::Result;
use axum::http::Request;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Extension;
use ef_channels::WebChatAdapter;
use ef_stores::EventStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub started_at: Instant,
    pub registry: Arc<ChannelRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub events: Arc<dyn EventStore>,
    pub search: SearchConfig,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = EventFinderConfig::load(config_path).await?;
    tracing::info!(
        base_url = %cfg.general.base_url,
        nlu_configured = !cfg.nlu.message_url.trim().is_empty(),
        database_configured = !cfg.database.url.trim().is_empty(),
        sms_enabled = cfg.sms.enabled,
        shortener_enabled = cfg.shortener.enabled,
        "config ok"
    );
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = EventFinderConfig::load(config_path).await?;
    tracing::info!(
        base_url = %cfg.general.base_url,
        bind = %cfg.server.bind,
        port = cfg.server.port,
        nlu_configured = !cfg.nlu.message_url.trim().is_empty(),
        database_configured = !cfg.database.url.trim().is_empty(),
        sms_enabled = cfg.sms.enabled,
        shortener_enabled = cfg.shortener.enabled,
        "status ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = EventFinderConfig::load(config_path).await?;
    let started_at = Instant::now();
    tracing::info!(
        base_url = %cfg.general.base_url,
        bind = %cfg.server.bind,
        port = cfg.server.port,
        nlu_configured = !cfg.nlu.message_url.trim().is_empty(),
        database_configured = !cfg.database.url.trim().is_empty(),
        sms_enabled = cfg.sms.enabled,
        shortener_enabled = cfg.shortener.enabled,
        search_initial_window_hours = cfg.search.initial_window_hours,
        search_max_window_hours = cfg.search.max_window_hours,
        search_max_results = cfg.search.max_results,
        "server configuration loaded"
    );

    let addr: SocketAddr = format!("{}:{}", cfg.server.bind, cfg.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;
    let listener = preflight_bind_listener(addr).await?;

    let backends = dev_backends::build_backends(&cfg);
    let sessions = Arc::new(SessionStore::new(backends.users.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorSettings {
            base_url: cfg.general.base_url.clone(),
            placeholder_name: cfg.general.placeholder_name.clone(),
            initial_window_hours: cfg.search.initial_window_hours,
            max_results: cfg.search.max_results,
            recent_search_limit: cfg.search.recent_search_limit,
            suggestion_terms: cfg.search.suggestion_terms.clone(),
        },
        backends.oracle,
        backends.events.clone(),
        backends.users.clone(),
        backends.dialogs,
        backends.sms,
        backends.shortener,
        sessions,
    ));
    let registry = Arc::new(ChannelRegistry::new());
    let resolver = Arc::new(IdentityResolver::new(backends.users.clone()));

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(1024);
    let webchat = Arc::new(WebChatAdapter::new());
    webchat.start(inbound_tx).await;

    let gateway = Arc::new(Gateway::new(
        resolver,
        backends.users.clone(),
        registry.clone(),
        orchestrator.clone(),
        inbound_rx,
    ));
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!("gateway started");

    let state = Arc::new(AppState {
        started_at,
        registry,
        orchestrator,
        events: backends.events,
        search: cfg.search.clone(),
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .merge(webchat.clone().router())
        .layer(CorsLayer::permissive())
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::new(Duration::from_secs(
            cfg.server.http_timeout_seconds,
        )))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "eventfinder serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }

    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "ctrl_c handler failed");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
            _ = shutdown.cancelled() => {},
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = shutdown.cancelled() => {},
        }
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
