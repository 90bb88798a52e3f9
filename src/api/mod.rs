pub mod files;
pub mod tus;

use crate::config::Config;
use crate::error::Result;
use crate::models::{
    CleanupResponse, DeleteResponse, DownloadInfo, FileInfo, FileListResponse, FileStatus,
    HealthResponse, RetentionInfo, RetentionPolicy, StorageUsage,
};
use crate::storage::ChunkStorage;
use crate::storage::cleanup::CleanupRunner;
use crate::storage::quota::QuotaAccountant;
use crate::store::UploadStore;
use axum::Json;
use axum::extract::State;
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

/// Shared application state, passed explicitly to every handler.
pub struct AppState {
    pub config: Config,
    pub store: UploadStore,
    pub storage: Arc<ChunkStorage>,
    pub quota: QuotaAccountant,
    pub cleanup: CleanupRunner,
}

/// Storage quota snapshot.
#[utoipa::path(
    get,
    path = "/storage",
    responses((status = 200, description = "Storage usage snapshot", body = StorageUsage)),
    tag = "storage"
)]
pub async fn storage_usage(State(state): State<Arc<AppState>>) -> Result<Json<StorageUsage>> {
    Ok(Json(state.quota.get_storage_usage().await?))
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Server is alive", body = HealthResponse)),
    tag = "storage"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(OpenApi)]
#[openapi(
    components(
        schemas(
            FileInfo,
            FileStatus,
            FileListResponse,
            DownloadInfo,
            RetentionInfo,
            RetentionPolicy,
            StorageUsage,
            DeleteResponse,
            CleanupResponse,
            HealthResponse
        )
    ),
    tags(
        (name = "files", description = "File management and download endpoints"),
        (name = "storage", description = "Storage and server status")
    )
)]
pub struct ApiDoc;

/// Create the JSON API router (mounted under `/api`).
pub fn create_api_router(state: Arc<AppState>) -> OpenApiRouter {
    OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(files::list_files))
        .routes(routes!(files::get_file_info))
        .routes(routes!(files::get_download_info))
        .routes(routes!(files::download_file))
        .routes(routes!(files::delete_file))
        .routes(routes!(files::trigger_cleanup))
        .routes(routes!(storage_usage))
        .routes(routes!(health))
        .with_state(state)
}
