//! Control API using Axum.

use crate::error::PreviewError;
use crate::manager::PreviewManager;
use crate::state::{ActivePreview, AppState, CreatedPreview, PreviewDetails};
use crate::workspace::FileMap;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// Request/Response types
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePreviewRequest {
    project_id: String,
    #[serde(default)]
    files: FileMap,
}

#[derive(Deserialize)]
struct UpdateFilesRequest {
    files: FileMap,
}

#[derive(Serialize)]
struct UpdateFilesResponse {
    success: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for PreviewError {
    fn into_response(self) -> Response {
        let status = match &self {
            PreviewError::PortExhausted { .. } | PreviewError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PreviewError::NotFound { .. } => StatusCode::NOT_FOUND,
            PreviewError::InvalidPath { .. } => StatusCode::BAD_REQUEST,
            PreviewError::FileSystem { .. } | PreviewError::Background(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %self, "Preview request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Build the control API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/previews", get(list_previews).post(create_preview).delete(stop_all_previews))
        .route("/previews/:id", get(get_preview).delete(stop_preview))
        .route("/previews/:id/files", put(update_files))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the control API until `shutdown` resolves.
///
/// The manager's previews are left running; the caller decides when to stop them.
pub async fn run_server(
    addr: SocketAddr,
    manager: Arc<PreviewManager>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_router(AppState::new(manager));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting control API on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> &'static str {
    "OK"
}

async fn create_preview(
    State(state): State<AppState>,
    Json(req): Json<CreatePreviewRequest>,
) -> Result<(StatusCode, Json<CreatedPreview>), PreviewError> {
    // Detached so a client hanging up cannot abandon a half-finished create.
    let manager = state.manager.clone();
    let created = tokio::spawn(async move {
        manager
            .create_preview_server(&req.project_id, &req.files)
            .await
    })
    .await??;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_previews(State(state): State<AppState>) -> Json<Vec<ActivePreview>> {
    Json(state.manager.active_servers().await)
}

async fn get_preview(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PreviewDetails>, PreviewError> {
    state
        .manager
        .get_server(&id)
        .await
        .map(Json)
        .ok_or(PreviewError::NotFound { id })
}

async fn update_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateFilesRequest>,
) -> Result<Json<UpdateFilesResponse>, PreviewError> {
    let manager = state.manager.clone();
    tokio::spawn(async move { manager.update_preview_files(&id, &req.files).await }).await??;
    Ok(Json(UpdateFilesResponse { success: true }))
}

async fn stop_preview(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    let manager = state.manager.clone();
    if let Err(e) = tokio::spawn(async move { manager.stop_preview_server(&id).await }).await {
        error!(error = %e, "Stop task failed");
    }
    StatusCode::NO_CONTENT
}

async fn stop_all_previews(State(state): State<AppState>) -> StatusCode {
    state.manager.stop_all_servers().await;
    StatusCode::NO_CONTENT
}
