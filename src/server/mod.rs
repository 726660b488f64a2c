pub mod health;
pub mod routes;
pub mod sse;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::daemon::coordinator::Coordinator;
use crate::daemon::events::JobEvent;
use crate::models::PipelineConfig;
use crate::registry::JobRegistry;
use crate::storage::ArtifactStore;

/// Shared application state for the Axum server.
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub registry: JobRegistry,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub event_tx: broadcast::Sender<JobEvent>,
    pub config: Arc<PipelineConfig>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        coordinator: Arc<Coordinator>,
        registry: JobRegistry,
        artifacts: Arc<dyn ArtifactStore>,
        event_tx: broadcast::Sender<JobEvent>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            coordinator,
            registry,
            artifacts,
            event_tx,
            config,
            start_time: Instant::now(),
        }
    }
}

/// Create the Axum router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_request_bytes;
    Router::new()
        .route("/health", get(health::health_check))
        .route("/jobs", get(routes::list_jobs).post(routes::create_job))
        .route("/jobs/upload", post(routes::upload_job))
        .route(
            "/jobs/{id}",
            get(routes::get_job).delete(routes::delete_job),
        )
        .route("/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/jobs/{id}/pages/{index}", get(routes::get_page))
        .route("/jobs/{id}/download", get(routes::download_job))
        .route("/artifacts/{artifact}", get(routes::get_artifact))
        .route("/events", get(sse::sse_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers([HeaderName::from_static(routes::TOTAL_COUNT_HEADER)]),
        )
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::mock::{MockOcr, MockTranslator, MockTypesetter};
    use crate::capabilities::{Capabilities, FetchedBody, RemoteFetcher};
    use crate::errors::PipelineError;
    use crate::models::{JobStatus, JobSummary};
    use crate::server::routes::{ErrorResponse, JobDetail, SubmitResponse};
    use crate::storage::{FsArtifactStore, JobStore, JsonJobStore};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct NoFetch;

    #[async_trait]
    impl RemoteFetcher for NoFetch {
        async fn fetch(&self, url: &str, _max: u64) -> Result<FetchedBody, PipelineError> {
            Err(PipelineError::FetchFailed {
                message: format!("GET {} refused", url),
                transient: false,
            })
        }
    }

    async fn setup_with(ocr: MockOcr) -> (Arc<AppState>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let jobs = Arc::new(JsonJobStore::new(tmp.path().to_path_buf()).await.unwrap())
            as Arc<dyn JobStore>;
        let artifacts = Arc::new(
            FsArtifactStore::new(tmp.path().join("artifacts"))
                .await
                .unwrap(),
        ) as Arc<dyn ArtifactStore>;
        let config = Arc::new(PipelineConfig {
            data_dir: Some(tmp.path().to_path_buf()),
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            ..Default::default()
        });
        let (event_tx, _) = broadcast::channel(256);
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&jobs),
            Arc::clone(&artifacts),
            Capabilities {
                ocr: Arc::new(ocr),
                translator: Arc::new(MockTranslator::prefix("EN:")),
                typesetter: Arc::new(MockTypesetter::new()),
            },
            Arc::new(NoFetch),
            Arc::clone(&config),
            event_tx.clone(),
        ));
        let state = Arc::new(AppState::new(
            coordinator,
            JobRegistry::new(jobs),
            artifacts,
            event_tx,
            config,
        ));
        (state, tmp)
    }

    async fn setup() -> (Arc<AppState>, TempDir) {
        setup_with(MockOcr::no_text()).await
    }

    fn png(marker: &str) -> Vec<u8> {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(marker.as_bytes());
        bytes
    }

    fn upload_body(pages: usize) -> String {
        let files: Vec<serde_json::Value> = (0..pages)
            .map(|i| {
                serde_json::json!({
                    "name": format!("{:02}.png", i),
                    "data": STANDARD.encode(png(&format!("p{}", i))),
                })
            })
            .collect();
        serde_json::json!({
            "sourceKind": "uploadBatch",
            "payload": {"files": files},
            "targetLanguage": "en",
        })
        .to_string()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn submit(state: &Arc<AppState>, pages: usize) -> uuid::Uuid {
        let app = create_router(Arc::clone(state));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(upload_body(pages)))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        body_json::<SubmitResponse>(response).await.job_id
    }

    async fn wait_terminal(state: &Arc<AppState>, id: uuid::Uuid) {
        for _ in 0..500 {
            let job = state.coordinator.get_status(id).await.unwrap();
            if job.status.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not finish");
    }

    #[tokio::test]
    async fn test_health_check() {
        let (state, _tmp) = setup().await;
        let app = create_router(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["totalJobs"], 0);
        assert_eq!(body["activeJobs"], 0);
    }

    #[tokio::test]
    async fn test_submit_and_get_job() {
        let (state, _tmp) = setup().await;
        let id = submit(&state, 2).await;
        wait_terminal(&state, id).await;

        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail: JobDetail = body_json(response).await;
        assert_eq!(detail.job.status, JobStatus::Completed);
        assert_eq!(detail.job.pages.len(), 2);
        assert_eq!(detail.progress, 1.0);
    }

    #[tokio::test]
    async fn test_submit_validation_error() {
        let (state, _tmp) = setup().await;
        let app = create_router(state);
        let body = serde_json::json!({
            "sourceKind": "remoteUrl",
            "payload": {"url": "ftp://example.com/a.zip"},
            "targetLanguage": "en",
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: ErrorResponse = body_json(response).await;
        assert_eq!(error.error, "validation_error");
    }

    #[tokio::test]
    async fn test_get_unknown_job_is_404() {
        let (state, _tmp) = setup().await;
        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{}", uuid::Uuid::now_v7()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_invalid_job_id_is_400() {
        let (state, _tmp) = setup().await;
        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/jobs/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_jobs_reports_total() {
        let (state, _tmp) = setup().await;
        for _ in 0..3 {
            let id = submit(&state, 1).await;
            wait_terminal(&state, id).await;
        }

        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/jobs?status=completed&perPage=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-total-count").unwrap(),
            "3"
        );
        let items: Vec<JobSummary> = body_json(response).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].date_created >= items[1].date_created);
    }

    #[tokio::test]
    async fn test_list_jobs_rejects_unknown_status() {
        let (state, _tmp) = setup().await;
        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/jobs?status=paused")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_page_not_ready_is_409() {
        let (state, _tmp) =
            setup_with(MockOcr::no_text().with_delay(|_| Duration::from_secs(5))).await;
        let id = submit(&state, 1).await;

        for _ in 0..100 {
            let job = state.coordinator.get_status(id).await.unwrap();
            if job.status == JobStatus::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let app = create_router(Arc::clone(&state));
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{}/pages/0", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let error: ErrorResponse = body_json(response).await;
        assert_eq!(error.error, "not_ready");

        state.coordinator.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_page_and_download_stream_bytes() {
        let (state, _tmp) = setup().await;
        let id = submit(&state, 2).await;
        wait_terminal(&state, id).await;

        let app = create_router(Arc::clone(&state));
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{}/pages/1?variant=source", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "image/png");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes.as_ref(), png("p1").as_slice());

        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{}/download", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/zip"
        );
        let disposition = response
            .headers()
            .get("content-disposition")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment;"));
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        assert_eq!(archive.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (state, _tmp) = setup().await;
        let id = submit(&state, 1).await;
        wait_terminal(&state, id).await;

        for _ in 0..2 {
            let app = create_router(Arc::clone(&state));
            let response = app
                .oneshot(
                    Request::builder()
                        .method("DELETE")
                        .uri(format!("/jobs/{}", id))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }
        assert!(state.artifacts.list_refs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_finished_job_returns_snapshot() {
        let (state, _tmp) = setup().await;
        let id = submit(&state, 1).await;
        wait_terminal(&state, id).await;

        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/jobs/{}/cancel", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail: JobDetail = body_json(response).await;
        assert_eq!(detail.job.status, JobStatus::Completed);
    }

    const BOUNDARY: &str = "XBOUNDARYX";

    fn multipart_body(files: &[(&str, Vec<u8>)], target_language: &str) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, bytes) in files {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{}\"\r\nContent-Type: image/png\r\n\r\n",
                    BOUNDARY, name
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"targetLanguage\"\r\n\r\n{}\r\n--{}--\r\n",
                BOUNDARY, target_language, BOUNDARY
            )
            .as_bytes(),
        );
        body
    }

    async fn post_multipart(state: &Arc<AppState>, body: Vec<u8>) -> axum::response::Response {
        create_router(Arc::clone(state))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs/upload")
                    .header(
                        "content-type",
                        format!("multipart/form-data; boundary={}", BOUNDARY),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let (state, _tmp) = setup().await;
        let body = multipart_body(&[("b.png", png("b")), ("a.png", png("a"))], "en");
        let response = post_multipart(&state, body).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let id = body_json::<SubmitResponse>(response).await.job_id;
        wait_terminal(&state, id).await;

        let job = state.coordinator.get_status(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.page_count, 2);
        assert_eq!(job.title, "a (+1 more)");
        // Natural name order, not form order.
        let first = state
            .artifacts
            .get(&job.pages[0].source_ref)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.bytes, png("a"));

        // Staged parts are gone once acquisition has copied them.
        let stored: std::collections::HashSet<_> =
            state.artifacts.list_refs().await.unwrap().into_iter().collect();
        let referenced: std::collections::HashSet<_> = job.artifact_refs().into_iter().collect();
        assert_eq!(stored, referenced);
    }

    #[tokio::test]
    async fn test_rejected_multipart_upload_keeps_nothing() {
        let (state, _tmp) = setup().await;
        let body = multipart_body(&[("a.png", png("a")), ("b.png", png("b"))], "not a language");
        let response = post_multipart(&state, body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.artifacts.list_refs().await.unwrap().is_empty());
        let (jobs, total) = state
            .registry
            .list(&Default::default(), Default::default(), Default::default())
            .await
            .unwrap();
        assert!(jobs.is_empty());
        assert_eq!(total, 0);
    }
}
