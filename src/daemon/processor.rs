use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capabilities::{Capabilities, CapabilityError, TextRegion, TypesetRegion};
use crate::daemon::events::JobEvent;
use crate::daemon::retry::{RetryError, RetryPolicy};
use crate::errors::PipelineError;
use crate::models::{ArtifactRef, PageStatus, PageUpdate, PipelineConfig, AUTO_LANGUAGE};
use crate::storage::{ArtifactStore, JobStore};

/// What a worker needs to know about the page it processes.
#[derive(Debug, Clone)]
pub struct PageTask {
    pub job_id: Uuid,
    pub index: usize,
    pub source_ref: ArtifactRef,
    pub source_language: String,
    pub target_language: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageReport {
    /// Language reported by OCR, if any.
    pub detected_language: Option<String>,
    pub rendered_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub ocr: Duration,
    pub translate: Duration,
    pub compose: Duration,
}

impl StageTimeouts {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            ocr: config.ocr_timeout(),
            translate: config.translate_timeout(),
            compose: config.compose_timeout(),
        }
    }
}

/// Drives one page through extraction, translation and composition.
///
/// The processor records the in-progress stages and the final `Done`. It never
/// writes `Failed`: errors are returned to the job supervisor, which decides
/// between failing and requeueing the page.
pub struct PageProcessor {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    capabilities: Capabilities,
    retry: RetryPolicy,
    timeouts: StageTimeouts,
    event_tx: broadcast::Sender<JobEvent>,
}

impl PageProcessor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
        capabilities: Capabilities,
        config: &PipelineConfig,
        event_tx: broadcast::Sender<JobEvent>,
    ) -> Self {
        Self {
            jobs,
            artifacts,
            capabilities,
            retry: RetryPolicy::from_config(config),
            timeouts: StageTimeouts::from_config(config),
            event_tx,
        }
    }

    pub async fn process(
        &self,
        task: &PageTask,
        cancel: &CancellationToken,
    ) -> Result<PageReport, PipelineError> {
        checkpoint(cancel)?;
        self.advance(task, PageUpdate::status(PageStatus::Extracting))
            .await?;

        let source = self
            .artifacts
            .get(&task.source_ref)
            .await
            .map_err(PipelineError::from_store)?
            .ok_or_else(|| {
                PipelineError::Internal(format!(
                    "source artifact {} of page {} is missing",
                    task.source_ref, task.index
                ))
            })?;
        let image = source.bytes;

        let regions = self.extract(task, &image, cancel).await?;
        let detected_language = regions.iter().find_map(|r| r.source_language.clone());

        if regions.is_empty() {
            debug!(
                "Page {} of job {} has no text, passing through",
                task.index, task.job_id
            );
            let len = image.len() as u64;
            self.advance(
                task,
                PageUpdate {
                    region_count: Some(0),
                    ..PageUpdate::done(task.source_ref.clone(), len)
                },
            )
            .await?;
            return Ok(PageReport {
                detected_language,
                rendered_bytes: len,
            });
        }

        checkpoint(cancel)?;
        self.advance(
            task,
            PageUpdate {
                region_count: Some(regions.len()),
                ..PageUpdate::status(PageStatus::Translating)
            },
        )
        .await?;

        let source_language = match task.source_language.as_str() {
            AUTO_LANGUAGE => detected_language.as_deref().unwrap_or(AUTO_LANGUAGE),
            language => language,
        };
        let translated = self
            .translate(task, &regions, source_language, cancel)
            .await?;

        checkpoint(cancel)?;
        self.advance(
            task,
            PageUpdate {
                regions_translated: Some(translated.len()),
                ..PageUpdate::status(PageStatus::Composing)
            },
        )
        .await?;

        let composed = self.compose(task, &image, &translated, cancel).await?;

        // Past this point the write is completed even if the job is cancelled.
        let len = composed.bytes.len() as u64;
        let rendered_ref = self
            .artifacts
            .put(composed.bytes, &composed.content_type)
            .await
            .map_err(PipelineError::from_store)?;
        if let Err(e) = self
            .advance(task, PageUpdate::done(rendered_ref.clone(), len))
            .await
        {
            if let Err(cleanup) = self.artifacts.delete(&rendered_ref).await {
                warn!("Failed to remove unreferenced render {}: {:#}", rendered_ref, cleanup);
            }
            return Err(e);
        }

        Ok(PageReport {
            detected_language,
            rendered_bytes: len,
        })
    }

    async fn advance(&self, task: &PageTask, update: PageUpdate) -> Result<(), PipelineError> {
        let status = update.status;
        self.jobs
            .update_page(task.job_id, task.index, update)
            .await
            .map_err(PipelineError::from_store)?;
        if let Some(status) = status {
            let _ = self
                .event_tx
                .send(JobEvent::page_changed(task.job_id, task.index, status));
        }
        Ok(())
    }

    async fn extract(
        &self,
        task: &PageTask,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<TextRegion>, PipelineError> {
        let ocr = &self.capabilities.ocr;
        let label = format!("OCR of page {} (job {})", task.index, task.job_id);
        let result = self
            .retry
            .run(&label, Some(self.timeouts.ocr), cancel, || ocr.detect_text(image))
            .await;

        let regions = result.map_err(|e| {
            stage_error(e, |message, transient| PipelineError::OcrFailed { message, transient })
        })?;
        Ok(regions
            .into_iter()
            .filter(|r| !r.text.trim().is_empty() && !r.bbox.is_empty())
            .collect())
    }

    /// Translate regions in order. A failing region keeps its original art;
    /// the page fails only when no region could be translated.
    async fn translate(
        &self,
        task: &PageTask,
        regions: &[TextRegion],
        source_language: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TypesetRegion>, PipelineError> {
        let translator = &self.capabilities.translator;
        let mut translated = Vec::with_capacity(regions.len());
        let mut last_error = None;

        for (n, region) in regions.iter().enumerate() {
            checkpoint(cancel)?;
            let language = region.source_language.as_deref().unwrap_or(source_language);
            let label = format!("translation of region {} on page {}", n, task.index);
            let result = self
                .retry
                .run(&label, Some(self.timeouts.translate), cancel, || {
                    translator.translate(&region.text, language, &task.target_language)
                })
                .await;

            match result {
                Ok(text) if !text.trim().is_empty() => translated.push(TypesetRegion {
                    bbox: region.bbox,
                    text,
                }),
                Ok(_) => debug!("Region {} on page {} translated to nothing", n, task.index),
                Err(RetryError::Cancelled) => return Err(cancelled()),
                Err(e) => {
                    let failure = stage_error(e, |message, transient| {
                        PipelineError::TranslationFailed { message, transient }
                    });
                    warn!(
                        "Region {} on page {} of job {} left untranslated: {}",
                        n, task.index, task.job_id, failure
                    );
                    last_error = Some(failure);
                }
            }
        }

        if translated.is_empty() {
            return Err(match last_error {
                Some(PipelineError::TranslationFailed { message, transient }) => {
                    PipelineError::TranslationFailed {
                        message: format!(
                            "all {} regions failed, last error: {}",
                            regions.len(),
                            message
                        ),
                        transient,
                    }
                }
                _ => PipelineError::TranslationFailed {
                    message: format!("none of {} regions produced a translation", regions.len()),
                    transient: false,
                },
            });
        }
        Ok(translated)
    }

    async fn compose(
        &self,
        task: &PageTask,
        image: &[u8],
        regions: &[TypesetRegion],
        cancel: &CancellationToken,
    ) -> Result<crate::capabilities::ComposedImage, PipelineError> {
        let typesetter = &self.capabilities.typesetter;
        let label = format!("composition of page {} (job {})", task.index, task.job_id);
        self.retry
            .run(&label, Some(self.timeouts.compose), cancel, || {
                typesetter.compose(image, regions)
            })
            .await
            .map_err(|e| stage_error(e, |message, _| PipelineError::ComposeFailed(message)))
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(cancelled());
    }
    Ok(())
}

fn cancelled() -> PipelineError {
    PipelineError::Cancelled("page processing was cancelled".to_string())
}

fn stage_error<F>(err: RetryError<CapabilityError>, build: F) -> PipelineError
where
    F: FnOnce(String, bool) -> PipelineError,
{
    match err {
        RetryError::Cancelled => cancelled(),
        RetryError::Exhausted { attempts, last } => {
            build(format!("{} (gave up after {} attempts)", last, attempts), true)
        }
        RetryError::Permanent(e) => build(e.to_string(), false),
    }
}
