use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

use super::AppState;
use crate::daemon::package::bundle_file_name;
use crate::errors::PipelineError;
use crate::models::{
    ArtifactRef, Job, JobStatus, NewJob, PageVariant, SourceKind, SourcePayload, StagedFile,
};
use crate::registry::{JobFilter, Pagination, SortOrder};
use crate::storage::ArtifactReader;

pub const TOTAL_COUNT_HEADER: &str = "x-total-count";

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// Map a pipeline error onto the HTTP status and error code clients see.
pub fn pipeline_error_response(err: &PipelineError) -> Response {
    let (status, code) = match err {
        PipelineError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
        PipelineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        PipelineError::NotReady(_) => (StatusCode::CONFLICT, "not_ready"),
        PipelineError::SourceTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "source_too_large"),
        PipelineError::UnsupportedFormat(_) => {
            (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_format")
        }
        PipelineError::StorageUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", err);
    } else {
        tracing::warn!("Request rejected: {}", err);
    }
    error_response(status, code, &err.to_string())
}

fn parse_job_id(raw: &str) -> Result<Uuid, PipelineError> {
    Uuid::parse_str(raw)
        .map_err(|_| PipelineError::Validation(format!("'{}' is not a valid job id", raw)))
}

/// Stream an artifact as the response body.
fn stream_artifact(artifact: ArtifactReader, disposition: Option<String>) -> Response {
    let mut response = Body::from_stream(ReaderStream::new(artifact.reader)).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&artifact.meta.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(artifact.meta.len));
    if let Some(value) = disposition.and_then(|d| HeaderValue::from_str(&d).ok()) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

// ---------------------------------------------------------------------------
// Query params
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsParams {
    pub status: Option<String>,
    pub q: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Deserialize, Default)]
pub struct PageParams {
    #[serde(default)]
    pub variant: PageVariant,
}

/// A job as returned by the detail endpoints, with its derived progress.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub progress: f64,
}

impl From<Job> for JobDetail {
    fn from(job: Job) -> Self {
        let progress = job.progress();
        Self { job, progress }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn submit(state: &AppState, new_job: NewJob) -> Response {
    match state.coordinator.submit(new_job).await {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse { job_id: job.id }),
        )
            .into_response(),
        Err(e) => pipeline_error_response(&e),
    }
}

/// POST /jobs
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(new_job): Json<NewJob>,
) -> impl IntoResponse {
    submit(&state, new_job).await
}

/// POST /jobs/upload: multipart form with `files` parts. Each part is
/// streamed into the artifact store as it arrives.
pub async fn upload_job(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut files = Vec::new();
    let form = match read_upload_form(&state, &mut multipart, &mut files).await {
        Ok(form) => form,
        Err(response) => {
            discard_staged(&state, &files).await;
            return response;
        }
    };

    let Some(target_language) = form.target_language else {
        discard_staged(&state, &files).await;
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "targetLanguage is required",
        );
    };

    let staged = files.clone();
    let new_job = NewJob {
        source_kind: SourceKind::UploadBatch,
        payload: SourcePayload::Staged { files },
        target_language,
        source_language: form.source_language,
        title: form.title,
        fail_fast: form.fail_fast,
    };
    match state.coordinator.submit(new_job).await {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse { job_id: job.id }),
        )
            .into_response(),
        Err(e) => {
            discard_staged(&state, &staged).await;
            pipeline_error_response(&e)
        }
    }
}

#[derive(Default)]
struct UploadForm {
    target_language: Option<String>,
    source_language: Option<String>,
    title: Option<String>,
    fail_fast: Option<bool>,
}

/// Parse the multipart body. Files stored so far are pushed to `staged` even
/// when parsing fails, so the caller can discard them.
async fn read_upload_form(
    state: &AppState,
    multipart: &mut Multipart,
    staged: &mut Vec<StagedFile>,
) -> Result<UploadForm, Response> {
    let mut form = UploadForm::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(form),
            Err(e) => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    &format!("Invalid multipart body: {}", e),
                ))
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        if name == "files" {
            let file_name = field.file_name().unwrap_or("page").to_string();
            let content_type = field.content_type().map(str::to_string);
            let stored_type = content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let mut reader = StreamReader::new(Box::pin(field.map(|chunk| {
                chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })));
            let stored = async {
                let artifact = state.artifacts.put_stream(&mut reader, &stored_type).await?;
                let len = match state.artifacts.stat(&artifact).await {
                    Ok(Some(meta)) => meta.len,
                    Ok(None) => anyhow::bail!("staged upload {} vanished", artifact),
                    Err(e) => {
                        let _ = state.artifacts.delete(&artifact).await;
                        return Err(e);
                    }
                };
                anyhow::Ok((artifact, len))
            };
            match stored.await {
                Ok((artifact, len)) => staged.push(StagedFile {
                    name: file_name,
                    content_type,
                    artifact,
                    len,
                }),
                Err(e) if is_client_stream_error(&e) => {
                    return Err(error_response(
                        StatusCode::BAD_REQUEST,
                        "validation_error",
                        &format!("Failed to read '{}': {:#}", file_name, e),
                    ))
                }
                Err(e) => {
                    return Err(pipeline_error_response(&PipelineError::from_store(e)));
                }
            }
            continue;
        }

        let value = match field.text().await {
            Ok(value) => value,
            Err(e) => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    &format!("Failed to read field '{}': {}", name, e),
                ))
            }
        };
        match name.as_str() {
            "targetLanguage" => form.target_language = Some(value),
            "sourceLanguage" => form.source_language = Some(value),
            "title" => form.title = Some(value),
            "failFast" => form.fail_fast = Some(matches!(value.trim(), "true" | "1" | "on")),
            other => tracing::debug!("Ignoring multipart field '{}'", other),
        }
    }
}

/// Whether a failed upload write was caused by the request body rather than
/// the store.
fn is_client_stream_error(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| io.kind() == std::io::ErrorKind::InvalidData)
}

async fn discard_staged(state: &AppState, files: &[StagedFile]) {
    for file in files {
        if let Err(e) = state.artifacts.delete(&file.artifact).await {
            tracing::warn!("Failed to discard staged upload {}: {:#}", file.artifact, e);
        }
    }
}

/// GET /jobs
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListJobsParams>,
) -> impl IntoResponse {
    let status = match params.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<JobStatus>() {
            Ok(status) => Some(status),
            Err(e) => return pipeline_error_response(&e),
        },
        None => None,
    };
    let pagination = match Pagination::new(params.page, params.per_page) {
        Ok(p) => p,
        Err(e) => return pipeline_error_response(&e),
    };
    let filter = JobFilter {
        status,
        text_query: params.q,
    };

    match state.registry.list(&filter, params.order, pagination).await {
        Ok((items, total)) => (
            StatusCode::OK,
            [(TOTAL_COUNT_HEADER, total.to_string())],
            Json(items),
        )
            .into_response(),
        Err(e) => pipeline_error_response(&e),
    }
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = match parse_job_id(&id) {
        Ok(id) => state.coordinator.get_status(id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(job) => (StatusCode::OK, Json(JobDetail::from(job))).into_response(),
        Err(e) => pipeline_error_response(&e),
    }
}

/// POST /jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = match parse_job_id(&id) {
        Ok(id) => state.coordinator.cancel(id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(job) => (StatusCode::OK, Json(JobDetail::from(job))).into_response(),
        Err(e) => pipeline_error_response(&e),
    }
}

/// DELETE /jobs/{id}
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = match parse_job_id(&id) {
        Ok(id) => state.coordinator.delete(id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => pipeline_error_response(&e),
    }
}

/// GET /jobs/{id}/pages/{index}
pub async fn get_page(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(String, usize)>,
    Query(params): Query<PageParams>,
) -> impl IntoResponse {
    let result = match parse_job_id(&id) {
        Ok(id) => state.coordinator.open_page(id, index, params.variant).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(artifact) => stream_artifact(artifact, None),
        Err(e) => pipeline_error_response(&e),
    }
}

/// GET /jobs/{id}/download
pub async fn download_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(e) => return pipeline_error_response(&e),
    };
    let (job, bundle) = match state.coordinator.ensure_bundle(id).await {
        Ok(found) => found,
        Err(e) => return pipeline_error_response(&e),
    };

    match state.artifacts.open(&bundle).await {
        Ok(Some(artifact)) => {
            let disposition = format!(
                "attachment; filename=\"{}\"",
                bundle_file_name(&job.title).replace('"', "")
            );
            stream_artifact(artifact, Some(disposition))
        }
        Ok(None) => pipeline_error_response(&PipelineError::Internal(format!(
            "bundle {} disappeared",
            bundle
        ))),
        Err(e) => pipeline_error_response(&PipelineError::from_store(e)),
    }
}

/// GET /artifacts/{ref}: raw artifact access, used for thumbnails.
pub async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> impl IntoResponse {
    let artifact = match ArtifactRef::parse(&raw) {
        Ok(r) => r,
        Err(e) => return pipeline_error_response(&e),
    };
    match state.artifacts.open(&artifact).await {
        Ok(Some(reader)) => stream_artifact(reader, None),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("Artifact '{}' not found", raw),
        ),
        Err(e) => pipeline_error_response(&PipelineError::from_store(e)),
    }
}
