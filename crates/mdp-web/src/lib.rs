//! Read-only HTTP surface: liveness probes and the persisted deal dataset.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use mdp_storage::DatasetStore;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "mdp-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub deals_path: PathBuf,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            port: lookup("PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
            deals_path: lookup("MDP_DEALS_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("deals.json")),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: DatasetStore,
}

impl AppState {
    pub fn new(deals_path: impl Into<PathBuf>) -> Self {
        Self {
            store: DatasetStore::new(deals_path),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness_handler))
        .route("/health", get(liveness_handler))
        .route("/deals.json", get(deals_handler))
        .fallback(not_found_handler)
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let state = AppState::new(config.deals_path.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, deals_path = %config.deals_path.display(), "serving deals");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env()).await
}

async fn liveness_handler() -> Response {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], "OK").into_response()
}

/// The dataset document as stored, re-read on every request.
async fn deals_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.read_raw().await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "application/json")], bytes).into_response(),
        Err(err) => {
            error!(error = %err, "dataset unavailable");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                "dataset unavailable",
            )
                .into_response()
        }
    }
}

async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}
