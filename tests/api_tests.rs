//! Integration tests for the HTTP API.
//!
//! These tests spawn a real Axum server on a random port, backed by on-disk
//! stores in a temp dir and scripted capabilities, and use reqwest to drive
//! it with actual HTTP requests.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use translateable::capabilities::mock::{MockOcr, MockTranslator, MockTypesetter};
use translateable::capabilities::{
    BoundingBox, Capabilities, FetchedBody, RemoteFetcher, TextRegion,
};
use translateable::daemon::coordinator::Coordinator;
use translateable::daemon::events::JobEvent;
use translateable::errors::PipelineError;
use translateable::models::{NewJob, PipelineConfig, SourceKind, SourcePayload, UploadFile};
use translateable::registry::JobRegistry;
use translateable::server::{self, AppState};
use translateable::storage::{ArtifactStore, FsArtifactStore, JsonJobStore};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Fake remote source
// ---------------------------------------------------------------------------

/// Serves one fixed body for every URL.
struct FixedFetcher {
    body: Vec<u8>,
    content_type: &'static str,
}

#[async_trait]
impl RemoteFetcher for FixedFetcher {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<FetchedBody, PipelineError> {
        if self.body.len() as u64 > max_bytes {
            return Err(PipelineError::SourceTooLarge(format!(
                "{} exceeds {} bytes",
                url, max_bytes
            )));
        }
        Ok(FetchedBody {
            bytes: self.body.clone(),
            content_type: Some(self.content_type.to_string()),
            final_url: reqwest::Url::parse(url)
                .map_err(|e| PipelineError::Validation(e.to_string()))?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helper to spawn a test server on a random port
// ---------------------------------------------------------------------------

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    coordinator: Arc<Coordinator>,
    artifacts: Arc<FsArtifactStore>,
    _tmp: TempDir,
    _handle: tokio::task::JoinHandle<()>,
}

fn test_config(max_workers: usize) -> PipelineConfig {
    PipelineConfig {
        max_workers,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..Default::default()
    }
}

async fn spawn_test_server(
    ocr: Arc<MockOcr>,
    config: PipelineConfig,
    fetcher: Arc<dyn RemoteFetcher>,
) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let jobs = Arc::new(JsonJobStore::new(tmp.path().to_path_buf()).await.unwrap());
    let artifacts = Arc::new(
        FsArtifactStore::new(tmp.path().join("artifacts"))
            .await
            .unwrap(),
    );
    let config = Arc::new(PipelineConfig {
        data_dir: Some(tmp.path().to_path_buf()),
        ..config
    });
    let (event_tx, _) = broadcast::channel::<JobEvent>(4096);

    let capabilities = Capabilities {
        ocr,
        translator: Arc::new(MockTranslator::prefix("EN:")),
        typesetter: Arc::new(MockTypesetter::new()),
    };
    let coordinator = Arc::new(Coordinator::new(
        jobs.clone(),
        artifacts.clone(),
        capabilities,
        fetcher,
        Arc::clone(&config),
        event_tx.clone(),
    ));
    let state = Arc::new(AppState::new(
        Arc::clone(&coordinator),
        JobRegistry::new(jobs),
        artifacts.clone(),
        event_tx,
        config,
    ));

    let router = server::create_router(state);

    // Bind to port 0 to get a random available port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to random port");
    let addr = listener.local_addr().expect("get local addr");
    let base_url = format!("http://{}", addr);

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base_url,
        client: reqwest::Client::new(),
        coordinator,
        artifacts,
        _tmp: tmp,
        _handle: handle,
    }
}

async fn spawn_upload_server(ocr: MockOcr, max_workers: usize) -> TestServer {
    let fetcher = Arc::new(FixedFetcher {
        body: Vec::new(),
        content_type: "text/plain",
    });
    spawn_test_server(Arc::new(ocr), test_config(max_workers), fetcher).await
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// PNG magic followed by a marker naming the page, e.g. `page-07`.
fn png(marker: &str) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(marker.as_bytes());
    bytes
}

/// The page number encoded in a fixture image by `png`.
fn page_number(image: &[u8]) -> usize {
    let text = String::from_utf8_lossy(&image[8.min(image.len())..]);
    text.rsplit('-')
        .next()
        .and_then(|n| n.trim().parse().ok())
        .unwrap_or(0)
}

fn region(text: &str) -> TextRegion {
    TextRegion {
        bbox: BoundingBox::new(0, 0, 20, 10),
        text: text.to_string(),
        source_language: Some("ja".to_string()),
    }
}

fn upload(markers: &[String], title: Option<&str>) -> NewJob {
    NewJob {
        source_kind: SourceKind::UploadBatch,
        payload: SourcePayload::Upload {
            files: markers
                .iter()
                .map(|m| UploadFile {
                    name: format!("{}.png", m),
                    content_type: Some("image/png".to_string()),
                    index: None,
                    data: png(m),
                })
                .collect(),
        },
        target_language: "en".to_string(),
        source_language: None,
        title: title.map(|t| t.to_string()),
        fail_fast: None,
    }
}

fn markers(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("page-{:02}", i)).collect()
}

impl TestServer {
    async fn submit(&self, new_job: &NewJob) -> String {
        let resp = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .json(new_job)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let json: Value = resp.json().await.unwrap();
        json["jobId"].as_str().unwrap().to_string()
    }

    async fn job(&self, id: &str) -> Value {
        let resp = self
            .client
            .get(format!("{}/jobs/{}", self.base_url, id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    /// Poll until the job reports `status`, failing after ten seconds.
    async fn wait_for_status(&self, id: &str, status: &str) -> Value {
        for _ in 0..500 {
            let job = self.job(id).await;
            if job["status"] == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} never reached {}: {}", id, status, self.job(id).await);
    }

    async fn page_bytes(&self, id: &str, index: usize, variant: &str) -> (u16, Vec<u8>) {
        let resp = self
            .client
            .get(format!(
                "{}/jobs/{}/pages/{}?variant={}",
                self.base_url, id, index, variant
            ))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.bytes().await.unwrap().to_vec())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_endpoint_returns_correct_structure() {
    let server = spawn_upload_server(MockOcr::no_text(), 2).await;

    let resp = server
        .client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["status"], "ok");
    assert!(json["uptimeSeconds"].is_number());
    assert_eq!(json["activeJobs"], 0);
    assert_eq!(json["totalJobs"], 0);
    assert_eq!(json["maxWorkers"], 2);
    assert_eq!(json["version"], "0.1.0");
}

#[tokio::test]
async fn test_three_page_upload_completes_end_to_end() {
    let server = spawn_upload_server(MockOcr::with_regions(vec![region("こんにちは")]), 2).await;

    let id = server.submit(&upload(&markers(3), Some("Chapter 1"))).await;
    let job = server.wait_for_status(&id, "completed").await;

    assert_eq!(job["title"], "Chapter 1");
    assert_eq!(job["pageCount"], 3);
    assert_eq!(job["pagesDone"], 3);
    assert_eq!(job["sourceLanguage"], "ja");
    assert_eq!(job["progress"], 1.0);
    let pages = job["pages"].as_array().unwrap();
    assert_eq!(pages.len(), 3);
    assert!(pages.iter().all(|p| p["status"] == "done"));
    let rendered_total: u64 = pages
        .iter()
        .map(|p| p["renderedBytes"].as_u64().unwrap())
        .sum();
    assert_eq!(job["totalBytes"], rendered_total);

    let (status, rendered) = server.page_bytes(&id, 1, "rendered").await;
    assert_eq!(status, 200);
    assert!(rendered.starts_with("composed[EN:こんにちは]\n".as_bytes()));

    let resp = server
        .client
        .get(format!("{}/jobs", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-total-count"], "1");
    let list: Value = resp.json().await.unwrap();
    assert_eq!(list[0]["id"], id.as_str());
    assert_eq!(list[0]["pages"], 3);
    assert_eq!(list[0]["size"], rendered_total);
    assert_eq!(list[0]["status"], "completed");
}

#[tokio::test]
async fn test_page_order_follows_submission_not_completion() {
    // Later pages finish first.
    let ocr = MockOcr::with_regions(vec![region("text")])
        .with_delay(|image| Duration::from_millis(30 * (10 - page_number(image) as u64)));
    let server = spawn_upload_server(ocr, 10).await;

    let id = server.submit(&upload(&markers(10), None)).await;
    let job = server.wait_for_status(&id, "completed").await;

    let pages = job["pages"].as_array().unwrap();
    let indexes: Vec<u64> = pages.iter().map(|p| p["index"].as_u64().unwrap()).collect();
    assert_eq!(indexes, (0..10).collect::<Vec<u64>>());

    for i in 0..10 {
        let (status, rendered) = server.page_bytes(&id, i, "rendered").await;
        assert_eq!(status, 200);
        assert!(
            rendered.ends_with(format!("page-{:02}", i).as_bytes()),
            "page {} holds the wrong image",
            i
        );
    }

    let resp = server
        .client
        .get(format!("{}/jobs/{}/download", server.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let bundle = resp.bytes().await.unwrap().to_vec();
    let mut archive = zip::ZipArchive::new(Cursor::new(bundle)).unwrap();
    assert_eq!(archive.len(), 10);
    assert_eq!(archive.by_index(0).unwrap().name(), "001.png");
    assert_eq!(archive.by_index(9).unwrap().name(), "010.png");
}

#[tokio::test]
async fn test_cancel_twenty_page_job_after_two_pages() {
    let ocr = Arc::new(
        MockOcr::with_regions(vec![region("text")]).with_delay(|_| Duration::from_millis(150)),
    );
    let fetcher = Arc::new(FixedFetcher {
        body: Vec::new(),
        content_type: "text/plain",
    });
    let server = spawn_test_server(Arc::clone(&ocr), test_config(1), fetcher).await;
    let mut events = server.coordinator.subscribe();

    let id = server.submit(&upload(&markers(20), None)).await;

    loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
            Ok(Ok(JobEvent::Progress { pages_done, .. })) if pages_done == 2 => break,
            Ok(Ok(_)) => continue,
            other => panic!("progress never reached 2 pages: {:?}", other),
        }
    }

    let resp = server
        .client
        .post(format!("{}/jobs/{}/cancel", server.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let calls_at_cancel = ocr.calls();

    let job = server.wait_for_status(&id, "failed").await;
    assert_eq!(job["error"]["kind"], "Cancelled");
    assert_eq!(job["pagesDone"], 2);

    let pages = job["pages"].as_array().unwrap();
    let done = pages.iter().filter(|p| p["status"] == "done").count();
    let failed = pages.iter().filter(|p| p["status"] == "failed").count();
    assert_eq!(done, 2);
    assert_eq!(failed, 18);
    assert!(pages
        .iter()
        .filter(|p| p["status"] == "failed")
        .all(|p| p["error"]["kind"] == "Cancelled"));

    // Nothing new was started after the cancel.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ocr.calls(), calls_at_cancel);

    // Done pages stay readable.
    let (status, _) = server.page_bytes(&id, 1, "rendered").await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_delete_twice_leaves_nothing_behind() {
    let server = spawn_upload_server(MockOcr::with_regions(vec![region("text")]), 2).await;

    let id = server.submit(&upload(&markers(3), None)).await;
    server.wait_for_status(&id, "completed").await;

    // Build the bundle too, so it has to be cleaned up as well.
    let resp = server
        .client
        .get(format!("{}/jobs/{}/download", server.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(!server.artifacts.list_refs().await.unwrap().is_empty());

    for _ in 0..2 {
        let resp = server
            .client
            .delete(format!("{}/jobs/{}", server.base_url, id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);
    }

    let resp = server
        .client
        .get(format!("{}/jobs/{}", server.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert!(server.artifacts.list_refs().await.unwrap().is_empty());

    let resp = server
        .client
        .get(format!("{}/jobs", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-total-count"], "0");
}

#[tokio::test]
async fn test_list_filters_by_status_newest_first() {
    // Pages marked "stuck" never finish OCR within the test.
    let ocr = MockOcr::no_text().with_delay(|image| {
        if String::from_utf8_lossy(image).contains("stuck") {
            Duration::from_secs(60)
        } else {
            Duration::ZERO
        }
    });
    let server = spawn_upload_server(ocr, 4).await;

    let first = server.submit(&upload(&markers(1), Some("First"))).await;
    server.wait_for_status(&first, "completed").await;

    let stuck = server
        .submit(&upload(&["stuck-01".to_string()], Some("Stuck")))
        .await;
    server.wait_for_status(&stuck, "processing").await;

    let last = server.submit(&upload(&markers(2), Some("Last"))).await;
    server.wait_for_status(&last, "completed").await;

    let resp = server
        .client
        .get(format!("{}/jobs?status=completed", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-total-count"], "2");
    let list: Value = resp.json().await.unwrap();
    let ids: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![last.as_str(), first.as_str()]);

    let resp = server
        .client
        .get(format!("{}/jobs?q=stu", server.base_url))
        .send()
        .await
        .unwrap();
    let list: Value = resp.json().await.unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["status"], "processing");

    server.coordinator.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_remote_archive_is_acquired_in_natural_order() {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for name in ["10.png", "2.png", "1.png"] {
        writer
            .start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer
            .write_all(&png(&format!("page-{}", name.trim_end_matches(".png"))))
            .unwrap();
    }
    let body = writer.finish().unwrap().into_inner();

    let fetcher = Arc::new(FixedFetcher {
        body,
        content_type: "application/zip",
    });
    let server =
        spawn_test_server(Arc::new(MockOcr::no_text()), test_config(2), fetcher).await;

    let new_job = NewJob {
        source_kind: SourceKind::RemoteUrl,
        payload: SourcePayload::Remote {
            url: "https://example.com/series/chapter-3.cbz".to_string(),
        },
        target_language: "en".to_string(),
        source_language: Some("ja".to_string()),
        title: None,
        fail_fast: None,
    };
    let id = server.submit(&new_job).await;
    let job = server.wait_for_status(&id, "completed").await;
    assert_eq!(job["pageCount"], 3);
    assert_eq!(job["sourceUrl"], "https://example.com/series/chapter-3.cbz");

    for (index, expected) in [(0, "page-1"), (1, "page-2"), (2, "page-10")] {
        let (status, bytes) = server.page_bytes(&id, index, "source").await;
        assert_eq!(status, 200);
        assert_eq!(bytes, png(expected));
    }
}

#[tokio::test]
async fn test_error_400_validation() {
    let server = spawn_upload_server(MockOcr::no_text(), 1).await;

    let resp = server
        .client
        .post(format!("{}/jobs", server.base_url))
        .json(&serde_json::json!({
            "sourceKind": "uploadBatch",
            "payload": {"files": []},
            "targetLanguage": "en"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "validation_error");
    assert!(json["message"].is_string());
}

#[tokio::test]
async fn test_error_404_not_found() {
    let server = spawn_upload_server(MockOcr::no_text(), 1).await;

    let resp = server
        .client
        .get(format!(
            "{}/jobs/01890000-0000-7000-8000-000000000000",
            server.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn test_sse_connection() {
    let server = spawn_upload_server(MockOcr::no_text(), 1).await;

    // Just verify the SSE endpoint is reachable and starts streaming
    let resp = server
        .client
        .get(format!("{}/events", server.base_url))
        .timeout(Duration::from_millis(500))
        .send()
        .await;

    match resp {
        Ok(r) => assert_eq!(r.status(), 200),
        Err(e) => assert!(e.is_timeout(), "Expected timeout, got: {}", e),
    }
}
