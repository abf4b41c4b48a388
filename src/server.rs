// Job API
//
// Transport surface over the stores: upload sessions, job inspection and
// cancellation, asset downloads via presigned URLs, and webhook
// registration. Owner identity arrives from the external auth layer as an
// `X-Owner-Id` header; absent means anonymous.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::blob_store::BlobStoreManager;
use crate::config::Config;
use crate::database::{Database, DbJob, DbWebhook};
use crate::models::{JobState, Stage};
use crate::upload::{UploadError, UploadSessionManager};
use crate::webhook::WebhookNotifier;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

/// API server state
#[derive(Clone)]
pub struct ApiState {
    pub db: Database,
    pub uploads: UploadSessionManager,
    pub blobs: BlobStoreManager,
    pub notifier: WebhookNotifier,
    pub config: Arc<Config>,
}

/// Create the Job API router
pub fn create_router(state: ApiState) -> Router {
    // Chunk bodies arrive raw; leave generous headroom over the fixed size.
    let chunk_body_limit = state.config.chunk_size_bytes as usize + 64 * 1024;

    Router::new()
        .route("/api/uploads/sessions", post(create_upload_session))
        .route("/api/uploads/:upload_id", get(get_upload_session))
        .route(
            "/api/uploads/:upload_id/chunks/:index",
            put(put_upload_chunk).layer(DefaultBodyLimit::max(chunk_body_limit)),
        )
        .route("/api/uploads/:upload_id/finalize", post(finalize_upload))
        .route("/api/uploads/:upload_id/abort", post(abort_upload))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:job_id", get(get_job))
        .route("/api/jobs/:job_id/cancel", post(cancel_job))
        .route("/api/jobs/:job_id/assets", get(list_job_assets))
        .route("/api/webhooks", post(register_webhook))
        .route("/api/webhooks/:webhook_id", delete(remove_webhook))
        .route("/api/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Error mapping
// ============================================================================

/// Wire error body: `{code, message}`.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

pub struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", format!("{what} not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", err.to_string())
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        let message = err.to_string();
        match err {
            UploadError::TooLarge(_) => {
                ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "TOO_LARGE", message)
            }
            UploadError::UnsupportedType(_) => {
                ApiError::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_TYPE", message)
            }
            UploadError::SessionNotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
            }
            UploadError::ChunkConflict(_) => {
                ApiError::new(StatusCode::CONFLICT, "CHUNK_CONFLICT", message)
            }
            UploadError::Incomplete { .. } => {
                ApiError::new(StatusCode::CONFLICT, "INCOMPLETE", message)
            }
            UploadError::HashMismatch { .. } => {
                ApiError::new(StatusCode::CONFLICT, "HASH_MISMATCH", message)
            }
            UploadError::SessionNotOpen(_) | UploadError::FinalizeInProgress(_) => {
                ApiError::new(StatusCode::CONFLICT, "SESSION_STATE", message)
            }
            UploadError::IndexOutOfRange { .. }
            | UploadError::LengthMismatch { .. }
            | UploadError::InvalidInput(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
            }
            UploadError::Storage(_) | UploadError::Database(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", message)
            }
        }
    }
}

fn owner_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-owner-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

// ============================================================================
// Upload endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub filename: String,
    pub total_size: i64,
    pub mime_type: String,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub upload_id: String,
    pub chunk_size: i64,
    pub expires_at: DateTime<Utc>,
}

async fn create_upload_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let owner = owner_from_headers(&headers);
    let session = state
        .uploads
        .create_session(&owner, &request.filename, request.total_size, &request.mime_type)
        .await?;

    Ok(Json(CreateSessionResponse {
        upload_id: session.upload_id,
        chunk_size: session.chunk_size,
        expires_at: session.expires_at,
    }))
}

#[derive(Debug, Serialize)]
pub struct ChunkUploadResponse {
    pub received: Vec<u32>,
    pub total_chunks: u32,
}

async fn put_upload_chunk(
    State(state): State<ApiState>,
    Path((upload_id, index)): Path<(String, u32)>,
    body: Bytes,
) -> Result<Json<ChunkUploadResponse>, ApiError> {
    let receipt = state.uploads.put_chunk(&upload_id, index, &body).await?;
    Ok(Json(ChunkUploadResponse {
        received: receipt.received,
        total_chunks: receipt.total_chunks,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct FinalizeRequest {
    /// Optional client-computed sha256 of the whole file, hex
    pub content_sha256: Option<String>,
    /// Requested language, or "auto" (default) for detection
    pub language: Option<String>,
    #[serde(default)]
    pub enable_diarization: bool,
}

#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub job_id: String,
}

async fn finalize_upload(
    State(state): State<ApiState>,
    Path(upload_id): Path<String>,
    body: Option<Json<FinalizeRequest>>,
) -> Result<Json<FinalizeResponse>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    // AUTO is represented as the absence of a requested language.
    let language = request
        .language
        .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("auto"));

    let outcome = state
        .uploads
        .finalize(
            &upload_id,
            request.content_sha256.as_deref(),
            language,
            request.enable_diarization,
        )
        .await?;

    info!(upload_id, job_id = %outcome.job_id, "job created from upload");
    Ok(Json(FinalizeResponse {
        job_id: outcome.job_id,
    }))
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub upload_id: String,
    pub state: String,
    pub total_size: i64,
    pub chunk_size: i64,
    pub total_chunks: u32,
    pub received: Vec<u32>,
    pub expires_at: DateTime<Utc>,
}

/// Session status, for clients resuming an interrupted upload.
async fn get_upload_session(
    State(state): State<ApiState>,
    Path(upload_id): Path<String>,
) -> Result<Json<SessionStatusResponse>, ApiError> {
    let session = state
        .db
        .get_session(&upload_id)
        .await?
        .ok_or_else(|| ApiError::not_found("upload session"))?;
    let received = state.db.received_chunk_indices(&upload_id).await?;

    Ok(Json(SessionStatusResponse {
        upload_id: session.upload_id.clone(),
        state: session.state.as_str().to_string(),
        total_size: session.total_size,
        chunk_size: session.chunk_size,
        total_chunks: session.total_chunks(),
        received,
        expires_at: session.expires_at,
    }))
}

async fn abort_upload(
    State(state): State<ApiState>,
    Path(upload_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.uploads.abort(&upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Job endpoints
// ============================================================================

#[derive(Debug, Serialize)]
pub struct JobErrorResponse {
    pub code: String,
    pub message: String,
    pub failed_stage: Option<String>,
    pub retry_count: i32,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: String,
    pub state: JobState,
    pub current_stage: Stage,
    pub progress: f64,
    pub language: Option<String>,
    pub detected_language: Option<String>,
    pub enable_diarization: bool,
    pub total_size: i64,
    pub total_duration_sec: Option<f64>,
    pub word_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobResponse {
    fn from_job(job: DbJob) -> Self {
        let error = job.error_code.as_ref().map(|code| JobErrorResponse {
            code: code.clone(),
            message: job.error_message.clone().unwrap_or_default(),
            failed_stage: job.failed_stage.clone(),
            retry_count: job.retry_count,
        });
        Self {
            job_id: job.job_id,
            state: job.state,
            current_stage: job.current_stage,
            progress: job.progress,
            language: job.language,
            detected_language: job.detected_language,
            enable_diarization: job.enable_diarization,
            total_size: job.total_size,
            total_duration_sec: job.total_duration_sec,
            word_count: job.word_count,
            error,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

async fn get_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .db
        .get_job(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found("job"))?;
    Ok(Json(JobResponse::from_job(job)))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    /// Explicit owner filter; defaults to the calling identity
    pub owner: Option<String>,
    pub state: Option<JobState>,
    pub limit: Option<i64>,
}

async fn list_jobs(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let owner = query.owner.unwrap_or_else(|| owner_from_headers(&headers));
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let jobs = state.db.list_user_jobs(&owner, query.state, limit).await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from_job).collect()))
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .db
        .get_job(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found("job"))?;

    if !state.db.request_cancel(&job_id).await? {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "ALREADY_TERMINAL",
            format!("job is already {}", job.state.as_str()),
        ));
    }

    let job = state
        .db
        .get_job(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found("job"))?;
    state.notifier.notify_job(&job);

    info!(job_id, "cancellation requested");
    Ok(Json(JobResponse::from_job(job)))
}

#[derive(Debug, Serialize)]
pub struct AssetResponse {
    pub kind: String,
    pub byte_size: i64,
    pub mime_type: String,
    pub download_url: String,
}

async fn list_job_assets(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<Vec<AssetResponse>>, ApiError> {
    if state.db.get_job(&job_id).await?.is_none() {
        return Err(ApiError::not_found("job"));
    }

    let ttl = Duration::from_secs(state.config.presign_ttl_seconds);
    let mut responses = Vec::new();
    for asset in state.db.list_assets(&job_id).await? {
        let download_url = state
            .blobs
            .presigned_get(&asset.storage_key, ttl)
            .await
            .map_err(|e| {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", e.to_string())
            })?;
        responses.push(AssetResponse {
            kind: asset.kind.as_str().to_string(),
            byte_size: asset.byte_size,
            mime_type: asset.mime_type,
            download_url,
        });
    }

    Ok(Json(responses))
}

// ============================================================================
// Webhook endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterWebhookRequest {
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterWebhookResponse {
    pub webhook_id: String,
}

async fn register_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<RegisterWebhookRequest>,
) -> Result<Json<RegisterWebhookResponse>, ApiError> {
    if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "webhook url must be http(s)",
        ));
    }

    let owner = owner_from_headers(&headers);
    let webhook = DbWebhook::new(&owner, &request.url, &request.secret);
    state.db.insert_webhook(&webhook).await?;

    Ok(Json(RegisterWebhookResponse {
        webhook_id: webhook.webhook_id,
    }))
}

async fn remove_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(webhook_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let owner = owner_from_headers(&headers);
    if !state.db.delete_webhook(&webhook_id, &owner).await? {
        return Err(ApiError::not_found("webhook"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub services: HealthServices,
}

#[derive(Debug, Serialize)]
pub struct HealthServices {
    pub database: String,
    pub webhooks: String,
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let database = match state.db.ping().await {
        Ok(()) => "healthy".to_string(),
        Err(_) => "error".to_string(),
    };
    let webhooks = if state.config.enable_webhooks {
        "enabled".to_string()
    } else {
        "disabled".to_string()
    };

    let status = if database == "healthy" { "ok" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services: HealthServices { database, webhooks },
    })
}
