//! HTTP server for the proxy
//!
//! Artifact requests are handled by the fallback route; administrative
//! endpoints live under `/_ctrl`.

use crate::error::ApiError;
use crate::proxy::Downloader;
use crate::types::{HealthResponse, PurgeParams, PurgeResponse};
use artifact_store::{ArtifactStore, PurgeSelector, StoreCount, StoreStats};
use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use chrono::{DateTime, Utc};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared state for the HTTP server
pub struct ServerState {
    pub store: Arc<ArtifactStore>,
    pub downloader: Downloader,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(store: Arc<ArtifactStore>, downloader: Downloader) -> Self {
        Self {
            store,
            downloader,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState, static_dir: &Path) -> Router {
    Router::new()
        .route("/_ctrl/health", get(health))
        .route("/_ctrl/stats", get(stats))
        .route("/_ctrl/count", get(count))
        .route("/_ctrl/data", delete(purge))
        .route("/_ctrl", get(ctrl_redirect))
        .route_service("/_ctrl/", ServeFile::new(static_dir.join("index.html")))
        .nest_service("/_ctrl/static", ServeDir::new(static_dir))
        .fallback(artifact)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until `stop` is cancelled
pub async fn start_server(
    state: SharedState,
    addr: SocketAddr,
    static_dir: &Path,
    stop: CancellationToken,
    grace: Duration,
) -> std::io::Result<()> {
    let router = create_router(state, static_dir);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    serve_until(listener, router, stop, grace).await
}

/// Serve on `listener` until `stop` is cancelled.
///
/// Once cancelled, no new connections are accepted and open ones get
/// `grace` to finish. Downloads still running after that are cut off.
pub async fn serve_until(
    listener: TcpListener,
    router: Router,
    stop: CancellationToken,
    grace: Duration,
) -> std::io::Result<()> {
    let serve = axum::serve(listener, router)
        .with_graceful_shutdown(stop.clone().cancelled_owned())
        .into_future();
    tokio::pin!(serve);

    tokio::select! {
        served = &mut serve => return served,
        _ = stop.cancelled() => {}
    }

    match tokio::time::timeout(grace, serve).await {
        Ok(served) => served,
        Err(_) => {
            warn!(grace = ?grace, "Open connections did not finish in time, closing them");
            Ok(())
        }
    }
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0) as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        mirrors: state.downloader.mirrors().len(),
    })
}

async fn stats(State(state): State<SharedState>) -> Json<StoreStats> {
    Json(state.store.stats())
}

async fn count(State(state): State<SharedState>) -> Result<Json<StoreCount>, ApiError> {
    Ok(Json(state.store.count().await?))
}

/// Remove entries older than `older-than-days`
async fn purge(
    State(state): State<SharedState>,
    params: Result<Query<PurgeParams>, QueryRejection>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let Query(params) =
        params.map_err(|e| ApiError::BadRequest(format!("malformed request: {}", e.body_text())))?;

    let days = params
        .older_than_days
        .filter(|days| !days.is_empty())
        .ok_or_else(|| ApiError::BadRequest("older-than-days not provided".to_string()))?;
    let days: i64 = days
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest("older-than-days is not an integer".to_string()))?;

    // A negative age selects everything, same as zero.
    let selector = PurgeSelector::older_than_days(days.max(0) as u64);
    let removed = state.store.purge(selector).await?;
    info!(days, removed, "On-demand purge finished");

    Ok(Json(PurgeResponse { removed }))
}

async fn ctrl_redirect() -> Response {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/_ctrl/")]).into_response()
}

/// Any path outside `/_ctrl` names an artifact
async fn artifact(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "GET")],
            "method not allowed\n",
        )
            .into_response();
    }

    state.downloader.serve(uri.path(), &headers).await
}
