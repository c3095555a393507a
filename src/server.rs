//! HTTP API over the catalog read path.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/novels/search?q=` | Novels whose title or author contains `q` |
//! | `GET`  | `/api/folders/search/{folder}` | Novels stored under a directory named `folder` |
//! | `GET`  | `/api/novels/{id}/chapters` | Table of contents in index order |
//! | `GET`  | `/api/chapters/{id}` | One chapter with its text |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "chapter not found: 42" } }
//! ```
//!
//! Error codes: `not_found` (404), `stale_reference` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser readers can
//! call the API directly.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::catalog::{Catalog, ChapterContent, ChapterFetch};
use crate::models::{ChapterSummary, NovelSummary};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    catalog: Catalog,
}

/// Builds the API router.
pub fn router(catalog: Catalog) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/novels/search", get(handle_search))
        .route("/api/folders/search/{folder}", get(handle_folder_search))
        .route("/api/novels/{id}/chapters", get(handle_chapters))
        .route("/api/chapters/{id}", get(handle_chapter))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { catalog })
}

/// Serves the API on `bind` until `shutdown` is cancelled.
pub async fn run_server(
    bind: &str,
    catalog: Catalog,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(catalog))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("request failed: {err:#}");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: err.to_string(),
        }
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn stale_reference(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "stale_reference",
        message: message.into(),
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: Option<String>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<NovelSummary>>, AppError> {
    Ok(Json(state.catalog.search(params.q.as_deref()).await?))
}

async fn handle_folder_search(
    State(state): State<AppState>,
    Path(folder): Path<String>,
) -> Result<Json<Vec<NovelSummary>>, AppError> {
    Ok(Json(state.catalog.search_folder(&folder).await?))
}

async fn handle_chapters(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChapterSummary>>, AppError> {
    match state.catalog.chapters(&id).await? {
        Some(chapters) => Ok(Json(chapters)),
        None => Err(not_found(format!("novel not found: {id}"))),
    }
}

async fn handle_chapter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChapterContent>, AppError> {
    match state.catalog.fetch_chapter(&id).await? {
        ChapterFetch::Content(chapter) => Ok(Json(chapter)),
        ChapterFetch::UnknownChapter => Err(not_found(format!("chapter not found: {id}"))),
        ChapterFetch::Stale(reason) => Err(stale_reference(format!("chapter {id}: {reason}"))),
    }
}
