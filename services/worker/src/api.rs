use crate::config::ApiConfig;
use crate::metadata_store::{FileRepository, RepositoryError};
use crate::model::{owner_archive_key, FileRecord};
use crate::s3_storage::{ObjectStorage, StorageError, ZIP_CONTENT_TYPE};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Header identifying the caller on `/v1` routes
pub const USER_EMAIL_HEADER: &str = "x-user-email";

/// Name and version reported by `/info`, fixed at startup
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn FileRepository>,
    pub storage: Arc<dyn ObjectStorage>,
    pub info: Arc<ServiceInfo>,
}

/// Caller email taken from [`USER_EMAIL_HEADER`]
#[derive(Debug, Clone)]
pub struct UserEmail(pub String);

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, error: &str, code: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

/// One entry of the status listing
#[derive(Debug, Serialize)]
pub struct FileStatusEntry {
    /// Archive file name, absent until an archive exists
    pub filename: Option<String>,
    pub size: Option<i64>,
    #[serde(rename = "statusId")]
    pub status_id: i32,
    pub status: String,
    #[serde(rename = "processingResult")]
    pub processing_result: Option<String>,
    pub created_at: String,
}

impl From<&FileRecord> for FileStatusEntry {
    fn from(record: &FileRecord) -> Self {
        Self {
            filename: record.archive_file_name().map(str::to_string),
            size: record.archive_size_bytes,
            status_id: record.status.id(),
            status: record.status.label().to_string(),
            processing_result: record.result_message.clone(),
            created_at: record.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileStatusResponse {
    pub files: Vec<FileStatusEntry>,
    pub total: usize,
}

/// Records owned by `email`
pub async fn list_records_by_owner_email(
    repository: &dyn FileRepository,
    email: &str,
) -> Result<Vec<FileRecord>, RepositoryError> {
    repository.list_records_by_owner_email(email).await
}

/// Contents of one of the owner's archives.
///
/// Names that could step outside the owner's archive directory are reported
/// as not found.
pub async fn download_archive(
    storage: &dyn ObjectStorage,
    owner_email: &str,
    filename: &str,
) -> Result<Bytes, StorageError> {
    if !is_plain_file_name(filename) {
        return Err(StorageError::NotFound(filename.to_string()));
    }

    let key = owner_archive_key(owner_email, filename);
    Ok(storage.get(&key).await?.data)
}

/// A single path segment that is also safe inside a quoted header value
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '"'])
        && !name.chars().any(char::is_control)
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let user_routes = Router::new()
        .route("/status", get(list_status))
        .route("/download/:filename", get(download))
        .route_layer(middleware::from_fn(require_user_email));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/info", get(service_info))
        .nest("/v1", user_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn require_user_email(mut request: Request, next: Next) -> Response {
    let email = request
        .headers()
        .get(USER_EMAIL_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    match email {
        Some(email) => {
            request.extensions_mut().insert(UserEmail(email));
            next.run(request).await
        }
        None => error_response(
            StatusCode::UNAUTHORIZED,
            "X-User-Email header is required",
            "UNAUTHORIZED",
        )
        .into_response(),
    }
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "UP" }))
}

async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(state.info.as_ref().clone())
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.repository.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip_all)]
async fn list_status(
    State(state): State<AppState>,
    Extension(UserEmail(email)): Extension<UserEmail>,
) -> Result<Json<FileStatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    let records = list_records_by_owner_email(state.repository.as_ref(), &email)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to list file records");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to list files",
                "QUERY_ERROR",
            )
        })?;

    let files: Vec<FileStatusEntry> = records.iter().map(FileStatusEntry::from).collect();
    let total = files.len();

    Ok(Json(FileStatusResponse { files, total }))
}

#[instrument(skip_all, fields(filename = %filename))]
async fn download(
    State(state): State<AppState>,
    Extension(UserEmail(email)): Extension<UserEmail>,
    Path(filename): Path<String>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let data = download_archive(state.storage.as_ref(), &email, &filename)
        .await
        .map_err(|e| match e {
            StorageError::NotFound(_) => {
                error_response(StatusCode::NOT_FOUND, "File not found", "NOT_FOUND")
            }
            other => {
                error!(error = %other, "Failed to download archive");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to download file",
                    "STORAGE_ERROR",
                )
            }
        })?;

    let headers = [
        (header::CONTENT_TYPE, ZIP_CONTENT_TYPE.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];

    Ok((headers, data).into_response())
}

/// Serve the API until `shutdown` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting status API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
