//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post},
};
use chime_core::config::ChimeConfig;
use chime_scheduler::{FanoutEngine, TopicRegistry};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ChimeConfig>,
    /// Topic lookup; also the engine's publisher.
    pub registry: Arc<TopicRegistry>,
    /// Fan-out engine: runs standard requests, tracks express notifiers.
    pub engine: Arc<FanoutEngine>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build topics and engine from config.
    pub fn from_config(config: ChimeConfig) -> chime_core::Result<Self> {
        let registry = Arc::new(TopicRegistry::from_config(&config.effective_topics())?);
        let engine = FanoutEngine::from_config(&config, registry.clone());
        Ok(Self {
            config: Arc::new(config),
            registry,
            engine: Arc::new(engine),
            start_time: std::time::Instant::now(),
        })
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/api/v1/notifications",
            post(super::routes::submit_notification),
        )
        .route(
            "/api/v1/deliveries",
            get(super::routes::list_deliveries),
        )
        .route("/api/v1/topics", get(super::routes::list_topics))
        .route("/api/v1/info", get(super::routes::system_info));

    let public = Router::new().route("/health", get(super::routes::health_check));

    api.merge(public)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: CHIME_CORS_ORIGINS=https://ops.example.com,https://admin.example.com
            if let Ok(origins_str) = std::env::var("CHIME_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server. Returns after ctrl-c, once detached notifiers have stopped.
pub async fn start(config: ChimeConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let state = Arc::new(AppState::from_config(config)?);
    let engine = state.engine.clone();

    tracing::info!(
        "📮 Topics: {}",
        state
            .registry
            .list()
            .iter()
            .map(|(name, kind)| format!("{name} ({kind:?})"))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let app = build_router_from_arc(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    tracing::info!("👋 Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown signal received");
}
