//! Router assembly and server lifecycle.

use std::sync::Arc;

use anyhow::Context;
use axum::middleware;
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::llm::{OpenRouterClient, ProviderKind, ProviderSet, ResponsesClient};
use crate::publish::HttpPublisher;
use crate::research::{SqliteTaskStore, Supervisor};
use crate::subjects::{JsonSubjectStore, SharedSubjectStore};

use super::auth;
use super::research;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub supervisor: Arc<Supervisor>,
    pub subjects: SharedSubjectStore,
}

/// Register a backend for every provider whose credentials are present.
fn build_providers(config: &Config) -> ProviderSet {
    let mut providers = ProviderSet::new();

    if let Some(key) = config.openai_api_key.clone() {
        let client = match config.openai_base_url.clone() {
            Some(base) => ResponsesClient::with_base_url(key, config.provider_a_model.clone(), base),
            None => ResponsesClient::new(key, config.provider_a_model.clone()),
        };
        providers = providers.with_retrying(Arc::new(client), config.provider_retry.clone());
    }

    if let Some(key) = config.openrouter_api_key.clone() {
        let b = OpenRouterClient::new(
            ProviderKind::ProviderB,
            key.clone(),
            config.provider_b_model.clone(),
        );
        let c = OpenRouterClient::new(
            ProviderKind::ProviderC,
            key,
            config.provider_c_model.clone(),
        );
        providers = providers
            .with_retrying(Arc::new(b), config.provider_retry.clone())
            .with_retrying(Arc::new(c), config.provider_retry.clone());
    }

    providers
}

/// Build the HTTP router over an existing state.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new().route("/api/health", get(health));

    let protected_routes = Router::new()
        .route("/api/research/start", post(research::start))
        .route("/api/research/resume", post(research::resume))
        .route("/api/research/stop", post(research::stop))
        .route("/api/research/events", get(research::events))
        .route("/api/research/:subject_id/status", get(research::status))
        .route(
            "/api/research/:subject_id/tracking-url",
            get(research::tracking),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let store = SqliteTaskStore::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    let subjects: SharedSubjectStore =
        Arc::new(JsonSubjectStore::new(config.subjects_path.clone()));

    let providers = build_providers(&config);
    if providers.configured().is_empty() {
        tracing::warn!("No research providers configured; every start will be rejected");
    } else {
        tracing::info!("Research providers: {:?}", providers.configured());
    }

    let mut supervisor = Supervisor::new(Arc::new(store), providers, Arc::clone(&subjects))
        .with_stale_lock_after(config.stale_lock_after);
    match config.publish.clone() {
        Some(publish) => {
            tracing::info!("Publishing reports to {}", publish.url);
            supervisor = supervisor.with_publisher(Arc::new(HttpPublisher::new(publish)));
        }
        None => tracing::warn!("PUBLISH_URL not set; completed reports will not be published"),
    }
    let supervisor = Arc::new(supervisor);
    supervisor
        .recover_stale_locks()
        .await
        .context("failed to recover stale research locks")?;

    let sweeper = supervisor.spawn_lock_sweeper();

    let state = Arc::new(AppState {
        config: config.clone(),
        supervisor: Arc::clone(&supervisor),
        subjects,
    });
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("Server listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.abort();
    supervisor.shutdown().await;

    served?;
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[derive(Debug, Serialize)]
struct ProviderInfo {
    kind: ProviderKind,
    name: &'static str,
    web_retrieval: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    auth_required: bool,
    providers: Vec<ProviderInfo>,
    publishing: bool,
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        auth_required: state.config.api_token.is_some(),
        providers: state
            .supervisor
            .providers()
            .configured()
            .into_iter()
            .map(|kind| ProviderInfo {
                kind,
                name: kind.display_name(),
                web_retrieval: kind.has_web_retrieval(),
            })
            .collect(),
        publishing: state.config.publish.is_some(),
    })
}
