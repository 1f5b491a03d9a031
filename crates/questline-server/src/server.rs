//! HTTP surface: `GET /api/negotiate` and `GET /health`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use questline_core::UserId;
use questline_settings::QuestlineSettings;

use crate::error::ServerError;
use crate::negotiate::Negotiator;
use crate::responder::ResponderConfig;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port (0 picks a free port).
    pub port: u16,
    /// Root of the content store.
    pub content_dir: PathBuf,
    /// Responder delivery policy.
    pub responder: ResponderConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7071,
            content_dir: PathBuf::from("content"),
            responder: ResponderConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build from the `server` settings section.
    pub fn from_settings(settings: &QuestlineSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            content_dir: PathBuf::from(&settings.server.content_dir),
            responder: ResponderConfig::from_settings(&settings.server),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Mints client access URLs.
    pub negotiator: Arc<Negotiator>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/negotiate", get(negotiate_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve the HTTP surface. Returns a handle holding the bound port.
pub async fn start(config: &ServerConfig, negotiator: Arc<Negotiator>) -> Result<ServerHandle, std::io::Error> {
    let app = build_router(AppState { negotiator });

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let port = listener.local_addr()?.port();
    tracing::info!(host = %config.host, port, "negotiate server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "negotiate server stopped");
        }
    });

    Ok(ServerHandle { port, server })
}

/// Handle to a running server. Dropping it leaves the server running.
pub struct ServerHandle {
    /// Port actually bound.
    pub port: u16,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop serving.
    pub fn abort(&self) {
        self.server.abort();
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateQuery {
    user_id: Option<String>,
}

async fn negotiate_handler(
    State(state): State<AppState>,
    Query(query): Query<NegotiateQuery>,
) -> Result<Json<Value>, ServerError> {
    let user = query
        .user_id
        .filter(|id| !id.trim().is_empty())
        .map_or_else(UserId::generate, UserId::from_raw);
    let url = state.negotiator.client_access_url(Some(&user))?;
    tracing::info!(user_id = %user, hub = state.negotiator.hub(), "client access url issued");
    Ok(Json(json!({ "url": url })))
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
