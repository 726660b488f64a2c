use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::io::{Seek, SeekFrom};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{broadcast, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capabilities::{Capabilities, RemoteFetcher};
use crate::daemon::acquirer::SourceAcquirer;
use crate::daemon::events::JobEvent;
use crate::daemon::package::{write_bundle, BundleEntry, BUNDLE_CONTENT_TYPE};
use crate::daemon::processor::{PageProcessor, PageReport, PageTask};
use crate::daemon::retry::{RetryError, RetryPolicy, Retryable};
use crate::errors::PipelineError;
use crate::models::{
    derive_title, validate_new_job, ArtifactRef, ErrorKind, Failure, FailurePolicy, Job,
    JobStatus, JobUpdate, NewJob, Page, PageStatus, PageUpdate, PageVariant, PipelineConfig,
    SourcePayload, AUTO_LANGUAGE,
};
use crate::storage::{ArtifactReader, ArtifactStore, JobStore};

const CANCELLED_BY_REQUEST: &str = "cancelled by request";
const CANCELLED_BY_SHUTDOWN: &str = "cancelled by daemon shutdown";
const INTERRUPTED: &str = "interrupted by daemon restart";

/// Cancellation of one job, with the reason recorded by whoever cancelled
/// first.
struct JobControl {
    token: CancellationToken,
    reason: Mutex<Option<String>>,
}

impl JobControl {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Mutex::new(None),
        }
    }

    fn cancel(&self, reason: &str) {
        if let Ok(mut current) = self.reason.lock() {
            if current.is_none() {
                *current = Some(reason.to_string());
            }
        }
        self.token.cancel();
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .ok()
            .and_then(|r| r.clone())
            .unwrap_or_else(|| CANCELLED_BY_SHUTDOWN.to_string())
    }
}

/// Handle to a running job supervisor.
struct SupervisorHandle {
    control: Arc<JobControl>,
    join_handle: JoinHandle<()>,
}

type ActiveJobs = Arc<RwLock<HashMap<Uuid, SupervisorHandle>>>;

/// Only storage outages are retried at the coordinator level; everything else
/// already went through the stage retries.
struct StorageFault(PipelineError);

impl Retryable for StorageFault {
    fn is_transient(&self) -> bool {
        matches!(self.0, PipelineError::StorageUnavailable(_))
    }

    fn timed_out(label: &str, after: Duration) -> Self {
        StorageFault(PipelineError::StorageUnavailable(format!(
            "{} timed out after {:.1}s",
            label,
            after.as_secs_f64()
        )))
    }
}

impl fmt::Display for StorageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Context {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    acquirer: SourceAcquirer,
    processor: PageProcessor,
    workers: Arc<Semaphore>,
    storage_retry: RetryPolicy,
    event_tx: broadcast::Sender<JobEvent>,
}

impl Context {
    async fn with_storage_retry<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let result = self
            .storage_retry
            .run(label, None, cancel, || op().map(|r| r.map_err(StorageFault)))
            .await;
        match result {
            Ok(value) => Ok(value),
            Err(RetryError::Cancelled) => Err(PipelineError::Cancelled(format!(
                "{} was cancelled",
                label
            ))),
            Err(RetryError::Exhausted { last, .. }) | Err(RetryError::Permanent(last)) => {
                Err(last.0)
            }
        }
    }

    async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<Job, PipelineError> {
        let jobs = &self.jobs;
        let update = &update;
        let status = update.status;
        let error = update.error.clone();
        let job = self
            .with_storage_retry("job update", &CancellationToken::new(), || {
                jobs.update_job(id, update.clone())
                    .map(|r| r.map_err(PipelineError::from_store))
            })
            .await?;
        if let Some(status) = status {
            let _ = self
                .event_tx
                .send(JobEvent::status_changed(id, status, error));
        }
        Ok(job)
    }

    async fn update_page(
        &self,
        id: Uuid,
        index: usize,
        update: PageUpdate,
    ) -> Result<Page, PipelineError> {
        let jobs = &self.jobs;
        let update = &update;
        let status = update.status;
        let page = self
            .with_storage_retry("page update", &CancellationToken::new(), || {
                jobs.update_page(id, index, update.clone())
                    .map(|r| r.map_err(PipelineError::from_store))
            })
            .await?;
        if let Some(status) = status {
            let _ = self
                .event_tx
                .send(JobEvent::page_changed(id, index, status));
        }
        Ok(page)
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, PipelineError> {
        self.jobs
            .get_job(id)
            .await
            .map_err(PipelineError::from_store)?
            .ok_or_else(|| PipelineError::NotFound(format!("Job with id '{}' not found", id)))
    }

    /// Fail every unfinished page of a job that has no supervisor, then the
    /// job itself.
    async fn close_orphan(&self, job: &Job, failure: Failure) -> Result<Job, PipelineError> {
        for page in job.pages.iter().filter(|p| !p.status.is_terminal()) {
            self.update_page(job.id, page.index, PageUpdate::failed(failure.clone()))
                .await?;
        }
        let job = self.get_job(job.id).await?;
        let tally = Tally::of(&job);
        self.update_job(
            job.id,
            JobUpdate {
                pages_done: Some(tally.done),
                pages_failed: Some(tally.failed),
                total_bytes: Some(tally.rendered_bytes),
                ..JobUpdate::failed(failure)
            },
        )
        .await
    }
}

/// Terminal page counts of a job.
struct Tally {
    done: usize,
    failed: usize,
    rendered_bytes: u64,
}

impl Tally {
    fn of(job: &Job) -> Self {
        let mut tally = Tally {
            done: 0,
            failed: 0,
            rendered_bytes: 0,
        };
        for page in &job.pages {
            match page.status {
                PageStatus::Done => {
                    tally.done += 1;
                    tally.rendered_bytes += page.rendered_bytes;
                }
                PageStatus::Failed => tally.failed += 1,
                _ => {}
            }
        }
        tally
    }
}

/// Owns the job lifecycle: one supervisor task per job, page work fanned out
/// to a worker pool shared by all jobs.
pub struct Coordinator {
    ctx: Arc<Context>,
    config: Arc<PipelineConfig>,
    active: ActiveJobs,
    root: CancellationToken,
    bundle_lock: tokio::sync::Mutex<()>,
}

impl Coordinator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
        capabilities: Capabilities,
        fetcher: Arc<dyn RemoteFetcher>,
        config: Arc<PipelineConfig>,
        event_tx: broadcast::Sender<JobEvent>,
    ) -> Self {
        let acquirer = SourceAcquirer::new(Arc::clone(&artifacts), fetcher, &config);
        let processor = PageProcessor::new(
            Arc::clone(&jobs),
            Arc::clone(&artifacts),
            capabilities,
            &config,
            event_tx.clone(),
        );
        let storage_retry = RetryPolicy {
            max_attempts: config.storage_retry_attempts + 1,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        };

        Self {
            ctx: Arc::new(Context {
                jobs,
                artifacts,
                acquirer,
                processor,
                workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
                storage_retry,
                event_tx,
            }),
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
            root: CancellationToken::new(),
            bundle_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.ctx.event_tx.subscribe()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Create the job record and start its supervisor. Returns as soon as the
    /// job exists in `Queued`.
    pub async fn submit(&self, request: NewJob) -> Result<Job, PipelineError> {
        validate_new_job(&request)?;
        if self.root.is_cancelled() {
            return Err(PipelineError::StorageUnavailable(
                "daemon is shutting down".to_string(),
            ));
        }

        let user_title = request
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let keep_title = user_title.is_some();
        let title = user_title.unwrap_or_else(|| derive_title(&request.payload));
        let policy = request
            .fail_fast
            .map(FailurePolicy::from_fail_fast)
            .unwrap_or_else(|| self.config.failure_policy());
        let source_language = request
            .source_language
            .clone()
            .unwrap_or_else(|| AUTO_LANGUAGE.to_string());

        let mut job = Job::new(
            title,
            request.source_kind,
            source_language,
            request.target_language.clone(),
            policy,
        );
        if let SourcePayload::Remote { ref url } = request.payload {
            job.source_url = Some(url.trim().to_string());
        }

        let job = self
            .ctx
            .jobs
            .create_job(job)
            .await
            .map_err(PipelineError::from_store)?;
        let _ = self.ctx.event_tx.send(JobEvent::Submitted {
            job_id: job.id,
            title: job.title.clone(),
            timestamp: Utc::now(),
        });
        info!("Job '{}' submitted ({})", job.title, job.id);

        let control = Arc::new(JobControl::new(self.root.child_token()));
        let supervisor = Supervisor {
            ctx: Arc::clone(&self.ctx),
            job_id: job.id,
            control: Arc::clone(&control),
        };

        // The supervisor removes itself from `active` when done, so it is
        // inserted before the lock is released.
        let mut active = self.active.write().await;
        let cleanup = Arc::clone(&self.active);
        let job_id = job.id;
        let payload = request.payload;
        let join_handle = tokio::spawn(async move {
            supervisor.run(payload, keep_title).await;
            cleanup.write().await.remove(&job_id);
        });
        active.insert(
            job.id,
            SupervisorHandle {
                control,
                join_handle,
            },
        );

        Ok(job)
    }

    /// Snapshot of a job with its pages. Never blocks on the supervisor.
    pub async fn get_status(&self, id: Uuid) -> Result<Job, PipelineError> {
        self.ctx.get_job(id).await
    }

    /// Stop scheduling pages of a job and signal its in-flight pages. The job
    /// ends as `Failed` with kind `Cancelled` once its supervisor winds down.
    /// Cancelling a terminal job returns it unchanged.
    pub async fn cancel(&self, id: Uuid) -> Result<Job, PipelineError> {
        let job = self.ctx.get_job(id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        let signalled = match self.active.read().await.get(&id) {
            Some(handle) => {
                handle.control.cancel(CANCELLED_BY_REQUEST);
                true
            }
            None => false,
        };

        if signalled {
            info!("Cancellation requested for job {}", id);
            self.ctx.get_job(id).await
        } else {
            warn!("Job {} has no supervisor, failing it directly", id);
            self.ctx
                .close_orphan(&job, Failure::cancelled(CANCELLED_BY_REQUEST))
                .await
        }
    }

    /// Remove a job, its pages and every artifact they reference. Deleting an
    /// unknown job succeeds. A job whose supervisor does not stop within the
    /// shutdown grace is left in place and `StorageUnavailable` is returned so
    /// the caller retries.
    pub async fn delete(&self, id: Uuid) -> Result<(), PipelineError> {
        let handle = self.active.write().await.remove(&id);
        if let Some(mut handle) = handle {
            handle.control.cancel("job deleted");
            if tokio::time::timeout(self.config.shutdown_grace(), &mut handle.join_handle)
                .await
                .is_err()
            {
                warn!("Supervisor of job {} is still stopping, delete deferred", id);
                self.active.write().await.entry(id).or_insert(handle);
                return Err(PipelineError::StorageUnavailable(format!(
                    "job {} is still stopping, retry the delete",
                    id
                )));
            }
        }

        let Some(job) = self
            .ctx
            .jobs
            .get_job(id)
            .await
            .map_err(PipelineError::from_store)?
        else {
            debug!("Delete of unknown job {} ignored", id);
            return Ok(());
        };

        for artifact in job.artifact_refs() {
            self.ctx
                .artifacts
                .delete(&artifact)
                .await
                .map_err(PipelineError::from_store)?;
        }
        self.ctx
            .jobs
            .delete_job(id)
            .await
            .map_err(PipelineError::from_store)?;

        let _ = self.ctx.event_tx.send(JobEvent::Deleted {
            job_id: id,
            timestamp: Utc::now(),
        });
        info!("Job '{}' deleted ({})", job.title, id);
        Ok(())
    }

    /// Open a page image. The rendered variant is only available once the
    /// page is `Done`; the source is available as soon as pages exist.
    pub async fn open_page(
        &self,
        id: Uuid,
        index: usize,
        variant: PageVariant,
    ) -> Result<ArtifactReader, PipelineError> {
        let page = self
            .ctx
            .jobs
            .get_page(id, index)
            .await
            .map_err(PipelineError::from_store)?;
        let Some(page) = page else {
            // Distinguish an unknown job from a job whose pages do not exist yet.
            let job = self.ctx.get_job(id).await?;
            return Err(if job.status == JobStatus::Queued || job.status == JobStatus::Acquiring {
                PipelineError::NotReady(format!("pages of job {} are not acquired yet", id))
            } else {
                PipelineError::NotFound(format!("Page {} of job '{}' not found", index, id))
            });
        };

        let artifact = match variant {
            PageVariant::Source => page.source_ref,
            PageVariant::Rendered => match (page.status, page.rendered_ref) {
                (PageStatus::Done, Some(rendered)) => rendered,
                (status, _) => {
                    return Err(PipelineError::NotReady(format!(
                        "page {} is {}",
                        index, status
                    )))
                }
            },
        };

        self.ctx
            .artifacts
            .open(&artifact)
            .await
            .map_err(PipelineError::from_store)?
            .ok_or_else(|| PipelineError::Internal(format!("artifact {} is missing", artifact)))
    }

    /// The job's download bundle, built on first request and reused after.
    /// Jobs that failed still deliver their `Done` pages.
    pub async fn ensure_bundle(&self, id: Uuid) -> Result<(Job, ArtifactRef), PipelineError> {
        let _guard = self.bundle_lock.lock().await;
        let job = self.ctx.get_job(id).await?;
        if !job.status.is_terminal() {
            return Err(PipelineError::NotReady(format!(
                "job {} is still {}",
                id, job.status
            )));
        }

        if let Some(ref existing) = job.bundle_ref {
            let meta = self
                .ctx
                .artifacts
                .stat(existing)
                .await
                .map_err(PipelineError::from_store)?;
            if meta.is_some() {
                let existing = existing.clone();
                return Ok((job, existing));
            }
            warn!("Bundle {} of job {} is missing, rebuilding", existing, id);
        }

        let mut entries = Vec::new();
        for page in &job.pages {
            let (PageStatus::Done, Some(rendered)) = (page.status, page.rendered_ref.as_ref())
            else {
                continue;
            };
            let artifact = self
                .ctx
                .artifacts
                .get(rendered)
                .await
                .map_err(PipelineError::from_store)?
                .ok_or_else(|| {
                    PipelineError::Internal(format!("rendered page {} is missing", page.index))
                })?;
            entries.push(BundleEntry {
                index: page.index,
                content_type: artifact.meta.content_type,
                bytes: artifact.bytes,
            });
        }
        if entries.is_empty() {
            return Err(PipelineError::NotReady(format!(
                "job {} has no translated pages",
                id
            )));
        }

        let page_count = entries.len();
        let spooled = tokio::task::spawn_blocking(move || spool_bundle(entries))
            .await
            .map_err(|e| PipelineError::Internal(format!("bundle task failed: {}", e)))??;
        let mut reader = tokio::fs::File::from_std(spooled);
        let bundle = self
            .ctx
            .artifacts
            .put_stream(&mut reader, BUNDLE_CONTENT_TYPE)
            .await
            .map_err(PipelineError::from_store)?;

        let update = JobUpdate {
            bundle_ref: Some(Some(bundle.clone())),
            ..Default::default()
        };
        let job = match self.ctx.update_job(id, update).await {
            Ok(job) => job,
            Err(e) => {
                if let Err(cleanup) = self.ctx.artifacts.delete(&bundle).await {
                    warn!("Failed to remove unreferenced bundle {}: {:#}", bundle, cleanup);
                }
                return Err(e);
            }
        };
        info!("Built bundle for job {} with {} pages", id, page_count);
        Ok((job, bundle))
    }

    /// Fail jobs left unfinished by a previous process. Must run before any
    /// new job is submitted.
    pub async fn recover_interrupted(&self) -> Result<usize, PipelineError> {
        let jobs = self
            .ctx
            .jobs
            .list_jobs()
            .await
            .map_err(PipelineError::from_store)?;

        let mut recovered = 0;
        for job in jobs.iter().filter(|j| !j.status.is_terminal()) {
            match self.ctx.close_orphan(job, Failure::internal(INTERRUPTED)).await {
                Ok(_) => {
                    warn!("Job '{}' ({}) was {}, marked failed", job.title, job.id, INTERRUPTED);
                    recovered += 1;
                }
                Err(e) => error!("Failed to recover job {}: {}", job.id, e),
            }
        }
        Ok(recovered)
    }

    /// Delete artifacts no job references, e.g. pages of an acquisition that
    /// was interrupted. Must not run while jobs are active.
    pub async fn sweep_orphaned_artifacts(&self) -> Result<usize, PipelineError> {
        let jobs = self
            .ctx
            .jobs
            .list_jobs()
            .await
            .map_err(PipelineError::from_store)?;
        let referenced: HashSet<ArtifactRef> =
            jobs.iter().flat_map(|j| j.artifact_refs()).collect();

        let stored = self
            .ctx
            .artifacts
            .list_refs()
            .await
            .map_err(PipelineError::from_store)?;
        let mut removed = 0;
        for artifact in stored.into_iter().filter(|r| !referenced.contains(r)) {
            match self.ctx.artifacts.delete(&artifact).await {
                Ok(()) => {
                    debug!("Removed orphaned artifact {}", artifact);
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove orphaned artifact {}: {:#}", artifact, e),
            }
        }
        if removed > 0 {
            info!("Removed {} orphaned artifacts", removed);
        }
        Ok(removed)
    }

    /// Refuse new jobs, cancel every active one and wait up to `grace` for
    /// their supervisors to record the outcome.
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<(Uuid, SupervisorHandle)> = {
            let mut active = self.active.write().await;
            for handle in active.values() {
                handle.control.cancel(CANCELLED_BY_SHUTDOWN);
            }
            active.drain().collect()
        };
        self.root.cancel();

        if handles.is_empty() {
            return;
        }
        info!("Waiting for {} active jobs to stop", handles.len());
        let ids: Vec<Uuid> = handles.iter().map(|(id, _)| *id).collect();
        let joins = futures_util::future::join_all(handles.into_iter().map(|(_, h)| h.join_handle));
        if tokio::time::timeout(grace, joins).await.is_err() {
            warn!(
                "Jobs {:?} did not stop within {}s, they will be recovered on next start",
                ids,
                grace.as_secs()
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Supervisor {
    ctx: Arc<Context>,
    job_id: Uuid,
    control: Arc<JobControl>,
}

impl Supervisor {
    async fn run(self, payload: SourcePayload, keep_title: bool) {
        if let Err(e) = self.drive(payload, keep_title).await {
            let failure = match e {
                PipelineError::Cancelled(_) => Failure::cancelled(self.control.reason()),
                ref other => other.failure(),
            };
            warn!("Job {} failed: {}", self.job_id, failure.message);
            if let Err(e) = self.ctx.update_job(self.job_id, JobUpdate::failed(failure)).await {
                error!("Failed to record failure of job {}: {}", self.job_id, e);
            }
        }
    }

    async fn drive(&self, payload: SourcePayload, keep_title: bool) -> Result<(), PipelineError> {
        let cancel = &self.control.token;
        self.ctx
            .update_job(self.job_id, JobUpdate::status(JobStatus::Acquiring))
            .await?;

        // The acquirer watches the job token and releases what it stored when
        // cancelled; the requeue loop must never drop it mid-write.
        let acquirer = &self.ctx.acquirer;
        let source = &payload;
        let acquired = self
            .ctx
            .with_storage_retry("acquisition", &CancellationToken::new(), || async move {
                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled(
                        "cancelled during acquisition".to_string(),
                    ));
                }
                acquirer.acquire(source, cancel).await
            })
            .await;
        acquirer.discard_staged(&payload).await;
        drop(payload);
        let acquired = acquired?;

        let pages: Vec<Page> = acquired
            .pages
            .iter()
            .enumerate()
            .map(|(index, p)| Page::new(self.job_id, index, p.source_ref.clone(), p.bytes))
            .collect();
        let mut update = JobUpdate {
            page_count: Some(acquired.page_count),
            ..JobUpdate::status(JobStatus::Processing)
        };
        if !keep_title {
            update.title = acquired.title_hint.clone();
        }
        let job = match self
            .ctx
            .jobs
            .materialize_pages(self.job_id, pages, update)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                self.ctx.acquirer.release(&acquired.pages).await;
                return Err(PipelineError::from_store(e));
            }
        };
        let _ = self.ctx.event_tx.send(JobEvent::status_changed(
            self.job_id,
            JobStatus::Processing,
            None,
        ));
        info!(
            "Job '{}' ({}) processing {} pages",
            job.title, job.id, job.page_count
        );

        let run = PageRun::new(self, &job);
        let outcome = run.execute().await;
        self.finalize(outcome).await
    }

    async fn finalize(&self, outcome: RunOutcome) -> Result<(), PipelineError> {
        let reason = self.control.reason();
        for index in &outcome.unstarted {
            let failure = Failure::cancelled(format!("not started: {}", reason));
            if let Err(e) = self
                .ctx
                .update_page(self.job_id, *index, PageUpdate::failed(failure))
                .await
            {
                error!("Failed to mark page {} of job {} cancelled: {}", index, self.job_id, e);
            }
        }

        let job = self.ctx.get_job(self.job_id).await?;
        for page in job.pages.iter().filter(|p| !p.status.is_terminal()) {
            let failure = Failure::internal(format!("page was left {}", page.status));
            self.ctx
                .update_page(self.job_id, page.index, PageUpdate::failed(failure))
                .await?;
        }

        let job = self.ctx.get_job(self.job_id).await?;
        let tally = Tally::of(&job);
        let counters = JobUpdate {
            pages_done: Some(tally.done),
            pages_failed: Some(tally.failed),
            total_bytes: Some(tally.rendered_bytes),
            ..Default::default()
        };

        if job.page_count > 0 && tally.done == job.page_count {
            self.ctx
                .update_job(
                    self.job_id,
                    JobUpdate {
                        status: Some(JobStatus::Completed),
                        ..counters
                    },
                )
                .await?;
            info!(
                "Job '{}' ({}) completed: {} pages, {} bytes",
                job.title, job.id, tally.done, tally.rendered_bytes
            );
            return Ok(());
        }

        let failure = match outcome.halt {
            Some(halt) => halt,
            None if self.control.token.is_cancelled() => Failure::cancelled(reason),
            None => summarize_failures(&job, tally.failed),
        };
        warn!(
            "Job '{}' ({}) failed with {} of {} pages done: {}",
            job.title, job.id, tally.done, job.page_count, failure.message
        );
        self.ctx
            .update_job(
                self.job_id,
                JobUpdate {
                    status: Some(JobStatus::Failed),
                    error: Some(failure),
                    ..counters
                },
            )
            .await?;
        Ok(())
    }
}

fn summarize_failures(job: &Job, failed: usize) -> Failure {
    match job
        .pages
        .iter()
        .find(|p| p.status == PageStatus::Failed)
        .and_then(|p| p.error.as_ref().map(|e| (p.index, e)))
    {
        Some((index, error)) => Failure::new(
            error.kind,
            format!(
                "{} of {} pages failed; page {}: {}",
                failed, job.page_count, index, error.message
            ),
        ),
        None => Failure::internal("job finished with unfinished pages"),
    }
}

/// Write the bundle to an anonymous temp file, rewound for reading.
fn spool_bundle(entries: Vec<BundleEntry>) -> Result<std::fs::File, PipelineError> {
    let spool_error =
        |e: std::io::Error| PipelineError::StorageUnavailable(format!("bundle spool file: {}", e));
    let file = tempfile::tempfile().map_err(spool_error)?;
    let mut file = write_bundle(entries, file)?;
    file.seek(SeekFrom::Start(0)).map_err(spool_error)?;
    Ok(file)
}

struct RunOutcome {
    halt: Option<Failure>,
    unstarted: Vec<usize>,
}

type WorkerResult = (usize, Result<PageReport, PipelineError>);

/// Page scheduling state of one job.
struct PageRun<'a> {
    supervisor: &'a Supervisor,
    job_id: Uuid,
    policy: FailurePolicy,
    source_language: String,
    target_language: String,
    source_refs: Vec<ArtifactRef>,
    queue: VecDeque<(usize, Duration)>,
    requeues: HashMap<usize, u32>,
    done: usize,
    failed: usize,
    halt: Option<Failure>,
}

impl<'a> PageRun<'a> {
    fn new(supervisor: &'a Supervisor, job: &Job) -> Self {
        Self {
            supervisor,
            job_id: job.id,
            policy: job.failure_policy,
            source_language: job.source_language.clone(),
            target_language: job.target_language.clone(),
            source_refs: job.pages.iter().map(|p| p.source_ref.clone()).collect(),
            queue: (0..job.pages.len()).map(|i| (i, Duration::ZERO)).collect(),
            requeues: HashMap::new(),
            done: 0,
            failed: 0,
            halt: None,
        }
    }

    async fn execute(mut self) -> RunOutcome {
        let ctx = Arc::clone(&self.supervisor.ctx);
        let cancel = self.supervisor.control.token.clone();
        let mut in_flight: JoinSet<WorkerResult> = JoinSet::new();

        loop {
            let can_schedule = !self.queue.is_empty() && !cancel.is_cancelled();
            if !can_schedule && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok((index, result)) => self.settle(index, result).await,
                        Err(e) => error!("Page worker of job {} was lost: {}", self.job_id, e),
                    }
                }
                _ = cancel.cancelled(), if can_schedule => {
                    debug!("Job {} stops scheduling pages", self.job_id);
                }
                permit = Arc::clone(&ctx.workers).acquire_owned(), if can_schedule => {
                    let Ok(permit) = permit else {
                        error!("Worker pool is closed, job {} cannot continue", self.job_id);
                        break;
                    };
                    if let Some((index, delay)) = self.queue.pop_front() {
                        self.spawn_worker(&mut in_flight, &ctx, &cancel, index, delay, permit);
                    }
                }
            }
        }

        RunOutcome {
            halt: self.halt,
            unstarted: self.queue.into_iter().map(|(index, _)| index).collect(),
        }
    }

    fn spawn_worker(
        &self,
        in_flight: &mut JoinSet<WorkerResult>,
        ctx: &Arc<Context>,
        cancel: &CancellationToken,
        index: usize,
        delay: Duration,
        permit: OwnedSemaphorePermit,
    ) {
        let task = PageTask {
            job_id: self.job_id,
            index,
            source_ref: self.source_refs[index].clone(),
            source_language: self.source_language.clone(),
            target_language: self.target_language.clone(),
        };
        let ctx = Arc::clone(ctx);
        let cancel = cancel.clone();

        in_flight.spawn(async move {
            let _permit = permit;
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return (index, Err(PipelineError::Cancelled("cancelled before retry".to_string())));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let result = AssertUnwindSafe(ctx.processor.process(&task, &cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(PipelineError::Internal(format!(
                        "worker for page {} panicked",
                        index
                    )))
                });
            (index, result)
        });
    }

    async fn settle(&mut self, index: usize, result: Result<PageReport, PipelineError>) {
        let supervisor = self.supervisor;
        let ctx = &supervisor.ctx;
        match result {
            Ok(report) => {
                self.done += 1;
                debug!("Page {} of job {} done", index, self.job_id);
                if self.source_language == AUTO_LANGUAGE {
                    if let Some(language) = report.detected_language {
                        let update = JobUpdate {
                            source_language: Some(language.clone()),
                            ..Default::default()
                        };
                        match ctx.update_job(self.job_id, update).await {
                            Ok(_) => {
                                info!("Job {} source language detected as {}", self.job_id, language);
                                self.source_language = language;
                            }
                            Err(e) => warn!("Failed to record detected language: {}", e),
                        }
                    }
                }
            }
            Err(PipelineError::StorageUnavailable(message))
                if !supervisor.control.token.is_cancelled()
                    && self.requeues.get(&index).copied().unwrap_or(0)
                        < ctx.storage_retry.max_attempts - 1 =>
            {
                let attempt = self.requeues.get(&index).copied().unwrap_or(0) + 1;
                self.requeues.insert(index, attempt);
                warn!(
                    "Page {} of job {} hit a storage outage ({}), requeueing (attempt {})",
                    index, self.job_id, message, attempt
                );
                let update = PageUpdate {
                    attempts: Some(attempt),
                    ..PageUpdate::status(PageStatus::Pending)
                };
                match ctx.update_page(self.job_id, index, update).await {
                    Ok(_) => {
                        let delay = ctx.storage_retry.delay_for(attempt);
                        self.queue.push_back((index, delay));
                        return;
                    }
                    Err(e) => {
                        self.fail(index, e).await;
                    }
                }
            }
            Err(e) => self.fail(index, e).await,
        }
        self.report_progress().await;
    }

    async fn fail(&mut self, index: usize, err: PipelineError) {
        let supervisor = self.supervisor;
        let ctx = &supervisor.ctx;
        let failure = match err {
            PipelineError::Cancelled(_) => Failure::cancelled(supervisor.control.reason()),
            ref other => other.failure(),
        };
        warn!(
            "Page {} of job {} failed: {}",
            index, self.job_id, failure.message
        );
        if let Err(e) = ctx
            .update_page(self.job_id, index, PageUpdate::failed(failure.clone()))
            .await
        {
            error!("Failed to record failure of page {}: {}", index, e);
        }
        self.failed += 1;

        if self.policy == FailurePolicy::FailFast
            && failure.kind != ErrorKind::Cancelled
            && self.halt.is_none()
        {
            info!("Job {} halted after page {} failed", self.job_id, index);
            self.halt = Some(Failure::new(
                failure.kind,
                format!("page {} failed: {}", index, failure.message),
            ));
            supervisor
                .control
                .cancel(&format!("halted after page {} failed", index));
        }
    }

    async fn report_progress(&self) {
        let ctx = &self.supervisor.ctx;
        let update = JobUpdate {
            pages_done: Some(self.done),
            pages_failed: Some(self.failed),
            ..Default::default()
        };
        match ctx.jobs.update_job(self.job_id, update).await {
            Ok(job) => {
                let _ = ctx.event_tx.send(JobEvent::Progress {
                    job_id: self.job_id,
                    pages_done: job.pages_done,
                    pages_failed: job.pages_failed,
                    page_count: job.page_count,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => warn!("Failed to update progress of job {}: {:#}", self.job_id, e),
        }
    }
}
