use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capabilities::{FetchedBody, RemoteFetcher};
use crate::daemon::formats::{
    expand_pdf, expand_zip, extract_image_links, extract_title, image_content_type,
    sniff, upload_order, RawPage, SourceFormat,
};
use crate::daemon::retry::{RetryError, RetryPolicy};
use crate::errors::PipelineError;
use crate::models::{ArtifactRef, PipelineConfig, SourcePayload, StagedFile, UploadFile};
use crate::storage::ArtifactStore;

#[derive(Debug, Clone, Copy)]
pub struct AcquireLimits {
    pub max_file_bytes: u64,
    pub max_remote_bytes: u64,
    pub max_expanded_bytes: u64,
    pub max_pages: usize,
}

impl AcquireLimits {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_file_bytes: config.max_file_bytes,
            max_remote_bytes: config.max_remote_bytes,
            max_expanded_bytes: config.max_expanded_bytes,
            max_pages: config.max_archive_pages,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AcquiredPage {
    pub source_ref: ArtifactRef,
    pub bytes: u64,
    pub content_type: String,
}

/// Ordered page images of a source, already written to the artifact store.
#[derive(Debug, Clone)]
pub struct AcquiredSource {
    pub pages: Vec<AcquiredPage>,
    pub page_count: usize,
    pub total_bytes: u64,
    /// Better title found while acquiring, e.g. an HTML `<title>`.
    pub title_hint: Option<String>,
}

pub struct SourceAcquirer {
    artifacts: Arc<dyn ArtifactStore>,
    fetcher: Arc<dyn RemoteFetcher>,
    limits: AcquireLimits,
    retry: RetryPolicy,
    fetch_timeout: Duration,
}

impl SourceAcquirer {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        fetcher: Arc<dyn RemoteFetcher>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            artifacts,
            fetcher,
            limits: AcquireLimits::from_config(config),
            retry: RetryPolicy::from_config(config),
            fetch_timeout: config.fetch_timeout(),
        }
    }

    /// Normalize a payload into ordered page images and store them. On any
    /// error every page already stored is deleted again.
    pub async fn acquire(
        &self,
        payload: &SourcePayload,
        cancel: &CancellationToken,
    ) -> Result<AcquiredSource, PipelineError> {
        let (raw, title_hint) = match payload {
            SourcePayload::Upload { files } => (self.expand_uploads(files).await?, None),
            SourcePayload::Staged { files } => (self.expand_staged(files).await?, None),
            SourcePayload::Remote { url } => self.acquire_remote(url, cancel).await?,
        };

        if raw.is_empty() {
            return Err(PipelineError::UnsupportedFormat(
                "source contains no pages".to_string(),
            ));
        }
        if raw.len() > self.limits.max_pages {
            return Err(PipelineError::SourceTooLarge(format!(
                "source has {} pages, limit is {}",
                raw.len(),
                self.limits.max_pages
            )));
        }
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let mut acquired = self.commit(raw, cancel).await?;
        acquired.title_hint = title_hint;
        info!(
            "Acquired {} pages ({} bytes)",
            acquired.page_count, acquired.total_bytes
        );
        Ok(acquired)
    }

    /// Delete the staged uploads of a payload once acquisition is over,
    /// whatever its outcome.
    pub async fn discard_staged(&self, payload: &SourcePayload) {
        for artifact in payload.staged_refs() {
            if let Err(e) = self.artifacts.delete(&artifact).await {
                warn!("Failed to discard staged upload {}: {:#}", artifact, e);
            }
        }
    }

    /// Delete stored pages. Failures are logged, not returned.
    pub async fn release(&self, pages: &[AcquiredPage]) {
        for page in pages {
            if let Err(e) = self.artifacts.delete(&page.source_ref).await {
                warn!("Failed to release source page {}: {:#}", page.source_ref, e);
            }
        }
    }

    async fn expand_uploads(&self, files: &[UploadFile]) -> Result<Vec<RawPage>, PipelineError> {
        let mut ordered: Vec<&UploadFile> = files.iter().collect();
        ordered.sort_by(|a, b| {
            upload_order((a.index, a.name.as_str()), (b.index, b.name.as_str()))
        });

        let mut budget = ExpansionBudget::new(self.limits);
        let mut pages = Vec::new();
        for file in ordered {
            self.check_file_size(&file.name, file.data.len() as u64)?;
            let expanded = self
                .expand(
                    file.name.clone(),
                    file.data.clone(),
                    file.content_type.clone(),
                    budget.remaining,
                )
                .await?;
            budget.spend(&expanded)?;
            debug!("'{}' expanded to {} pages", file.name, expanded.len());
            pages.extend(expanded);
        }
        Ok(pages)
    }

    /// Like `expand_uploads`, reading each file back from the artifact store.
    async fn expand_staged(&self, files: &[StagedFile]) -> Result<Vec<RawPage>, PipelineError> {
        let mut ordered: Vec<&StagedFile> = files.iter().collect();
        ordered.sort_by(|a, b| upload_order((None, a.name.as_str()), (None, b.name.as_str())));

        let mut budget = ExpansionBudget::new(self.limits);
        let mut pages = Vec::new();
        for file in ordered {
            self.check_file_size(&file.name, file.len)?;
            let staged = self
                .artifacts
                .get(&file.artifact)
                .await
                .map_err(PipelineError::from_store)?
                .ok_or_else(|| {
                    PipelineError::Internal(format!("staged upload '{}' is missing", file.name))
                })?;
            let expanded = self
                .expand(
                    file.name.clone(),
                    staged.bytes,
                    file.content_type.clone(),
                    budget.remaining,
                )
                .await?;
            budget.spend(&expanded)?;
            debug!("'{}' expanded to {} pages", file.name, expanded.len());
            pages.extend(expanded);
        }
        Ok(pages)
    }

    fn check_file_size(&self, name: &str, len: u64) -> Result<(), PipelineError> {
        if len > self.limits.max_file_bytes {
            return Err(PipelineError::SourceTooLarge(format!(
                "'{}' is {} bytes, limit is {}",
                name, len, self.limits.max_file_bytes
            )));
        }
        Ok(())
    }

    async fn acquire_remote(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(Vec<RawPage>, Option<String>), PipelineError> {
        let body = self
            .fetch(url, self.limits.max_remote_bytes, cancel)
            .await?;

        if sniff(&body.bytes, body.content_type.as_deref()) != Some(SourceFormat::Html) {
            let name = remote_name(&body);
            let pages = self
                .expand(name, body.bytes, body.content_type, self.limits.max_expanded_bytes)
                .await?;
            return Ok((pages, None));
        }

        let html = String::from_utf8_lossy(&body.bytes).into_owned();
        let links = extract_image_links(&html, &body.final_url);
        if links.is_empty() {
            return Err(PipelineError::UnsupportedFormat(format!(
                "{} is an HTML page without images",
                url
            )));
        }
        if links.len() > self.limits.max_pages {
            return Err(PipelineError::SourceTooLarge(format!(
                "{} references {} images, limit is {}",
                url,
                links.len(),
                self.limits.max_pages
            )));
        }
        debug!("{} references {} images", url, links.len());

        let mut remaining = self
            .limits
            .max_remote_bytes
            .saturating_sub(body.bytes.len() as u64);
        let mut pages = Vec::with_capacity(links.len());
        for link in links {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            let image = self.fetch(link.as_str(), remaining, cancel).await?;
            remaining = remaining.saturating_sub(image.bytes.len() as u64);
            match sniff(&image.bytes, None) {
                Some(SourceFormat::Image(format)) => pages.push(RawPage {
                    name: remote_name(&image),
                    bytes: image.bytes,
                    content_type: image_content_type(format),
                }),
                _ => {
                    return Err(PipelineError::UnsupportedFormat(format!(
                        "{} is not an image",
                        link
                    )))
                }
            }
        }
        Ok((pages, extract_title(&html)))
    }

    async fn fetch(
        &self,
        url: &str,
        max_bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<FetchedBody, PipelineError> {
        let fetcher = &self.fetcher;
        let result = self
            .retry
            .run("fetch", Some(self.fetch_timeout), cancel, || {
                fetcher.fetch(url, max_bytes)
            })
            .await;
        match result {
            Ok(body) => Ok(body),
            Err(RetryError::Cancelled) => Err(cancelled()),
            Err(RetryError::Exhausted { last, .. }) | Err(RetryError::Permanent(last)) => Err(last),
        }
    }

    /// Sniff and expand one file off the async runtime. The pages may hold at
    /// most `budget` bytes in total.
    async fn expand(
        &self,
        name: String,
        data: Vec<u8>,
        declared: Option<String>,
        budget: u64,
    ) -> Result<Vec<RawPage>, PipelineError> {
        let limits = self.limits;
        tokio::task::spawn_blocking(move || {
            expand_file(name, data, declared.as_deref(), limits, budget)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("expansion task failed: {}", e)))?
    }

    async fn commit(
        &self,
        raw: Vec<RawPage>,
        cancel: &CancellationToken,
    ) -> Result<AcquiredSource, PipelineError> {
        let mut written: Vec<AcquiredPage> = Vec::with_capacity(raw.len());
        for page in raw {
            if cancel.is_cancelled() {
                self.release(&written).await;
                return Err(cancelled());
            }
            let len = page.bytes.len() as u64;
            match self.artifacts.put(page.bytes, &page.content_type).await {
                Ok(source_ref) => written.push(AcquiredPage {
                    source_ref,
                    bytes: len,
                    content_type: page.content_type,
                }),
                Err(e) => {
                    warn!(
                        "Storing page '{}' failed, releasing {} stored pages",
                        page.name,
                        written.len()
                    );
                    self.release(&written).await;
                    return Err(PipelineError::from_store(e));
                }
            }
        }

        let total_bytes = written.iter().map(|p| p.bytes).sum();
        Ok(AcquiredSource {
            page_count: written.len(),
            pages: written,
            total_bytes,
            title_hint: None,
        })
    }
}

/// Page bytes a multi-file source may still expand to.
struct ExpansionBudget {
    limit: u64,
    remaining: u64,
}

impl ExpansionBudget {
    fn new(limits: AcquireLimits) -> Self {
        Self {
            limit: limits.max_expanded_bytes,
            remaining: limits.max_expanded_bytes,
        }
    }

    fn spend(&mut self, pages: &[RawPage]) -> Result<(), PipelineError> {
        let used: u64 = pages.iter().map(|p| p.bytes.len() as u64).sum();
        if used > self.remaining {
            return Err(PipelineError::SourceTooLarge(format!(
                "source expands to more than {} bytes",
                self.limit
            )));
        }
        self.remaining -= used;
        Ok(())
    }
}

fn cancelled() -> PipelineError {
    PipelineError::Cancelled("cancelled during acquisition".to_string())
}

fn remote_name(body: &FetchedBody) -> String {
    body.final_url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .unwrap_or("remote")
        .to_string()
}

fn expand_file(
    name: String,
    data: Vec<u8>,
    declared: Option<&str>,
    limits: AcquireLimits,
    budget: u64,
) -> Result<Vec<RawPage>, PipelineError> {
    match sniff(&data, declared) {
        Some(SourceFormat::Image(format)) => Ok(vec![RawPage {
            name,
            bytes: data,
            content_type: image_content_type(format),
        }]),
        Some(SourceFormat::Zip) => {
            expand_zip(&data, limits.max_file_bytes, budget, limits.max_pages)
        }
        Some(SourceFormat::Pdf) => expand_pdf(&data, limits.max_pages),
        Some(SourceFormat::Html) | None => Err(PipelineError::UnsupportedFormat(format!(
            "'{}' is not an image, archive or PDF",
            name
        ))),
    }
}
