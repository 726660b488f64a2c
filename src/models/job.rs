use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::daemon::formats::upload_order;
use crate::errors::PipelineError;
use crate::models::{ArtifactRef, Failure, Page, PageStatus};

/// Source language value meaning "detect from the OCR result".
pub const AUTO_LANGUAGE: &str = "auto";

const MAX_TITLE_LEN: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Acquiring,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward-only job lifecycle. `Queued -> Failed` covers jobs cancelled
    /// or interrupted before acquisition started.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Acquiring)
                | (Queued, Failed)
                | (Acquiring, Processing)
                | (Acquiring, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Acquiring => "acquiring",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "acquiring" => Ok(JobStatus::Acquiring),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PipelineError::Validation(format!(
                "Unknown job status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
    UploadBatch,
    RemoteUrl,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// The first page failure halts scheduling and fails the job.
    FailFast,
    /// Every page is attempted; done pages stay readable if others fail.
    BestEffort,
}

impl FailurePolicy {
    pub fn from_fail_fast(fail_fast: bool) -> Self {
        if fail_fast {
            FailurePolicy::FailFast
        } else {
            FailurePolicy::BestEffort
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub title: String,
    pub source_kind: SourceKind,
    pub source_language: String,
    pub target_language: String,
    #[serde(default)]
    pub page_count: usize,
    #[serde(default)]
    pub total_bytes: u64,
    pub status: JobStatus,
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub pages_done: usize,
    #[serde(default)]
    pub pages_failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_ref: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ordered by index. Filled in by the store when a job is read.
    #[serde(default)]
    pub pages: Vec<Page>,
}

impl Job {
    pub fn new(
        title: String,
        source_kind: SourceKind,
        source_language: String,
        target_language: String,
        failure_policy: FailurePolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            title,
            source_kind,
            source_language,
            target_language,
            page_count: 0,
            total_bytes: 0,
            status: JobStatus::Queued,
            failure_policy,
            pages_done: 0,
            pages_failed: 0,
            error: None,
            bundle_ref: None,
            source_url: None,
            created_at: now,
            updated_at: now,
            pages: Vec::new(),
        }
    }

    /// Fraction of pages that reached a terminal state.
    pub fn progress(&self) -> f64 {
        if self.page_count == 0 {
            return if self.status == JobStatus::Completed {
                1.0
            } else {
                0.0
            };
        }
        (self.pages_done + self.pages_failed) as f64 / self.page_count as f64
    }

    /// Ref of the image the dashboard shows as the job's cover.
    pub fn thumbnail_ref(&self) -> Option<&ArtifactRef> {
        let first = self.pages.first()?;
        match (first.status, first.rendered_ref.as_ref()) {
            (PageStatus::Done, Some(rendered)) => Some(rendered),
            _ => Some(&first.source_ref),
        }
    }

    /// Apply an update, rejecting backward or skipped status transitions and
    /// any decrease of `pageCount`.
    pub fn apply(&mut self, update: JobUpdate) -> Result<(), PipelineError> {
        if let Some(next) = update.status {
            if next != self.status && !self.status.can_transition_to(next) {
                return Err(PipelineError::Internal(format!(
                    "illegal job transition {} -> {} for job {}",
                    self.status, next, self.id
                )));
            }
            if next == JobStatus::Failed && update.error.is_none() && self.error.is_none() {
                return Err(PipelineError::Internal(format!(
                    "job {} cannot fail without an error",
                    self.id
                )));
            }
        }
        if let Some(count) = update.page_count {
            if count < self.page_count {
                return Err(PipelineError::Internal(format!(
                    "pageCount of job {} cannot decrease from {} to {}",
                    self.id, self.page_count, count
                )));
            }
        }

        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(title) = update.title {
            self.title = title;
        }
        if let Some(language) = update.source_language {
            self.source_language = language;
        }
        if let Some(count) = update.page_count {
            self.page_count = count;
        }
        if let Some(bytes) = update.total_bytes {
            self.total_bytes = bytes;
        }
        if let Some(done) = update.pages_done {
            self.pages_done = done;
        }
        if let Some(failed) = update.pages_failed {
            self.pages_failed = failed;
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(bundle_ref) = update.bundle_ref {
            self.bundle_ref = bundle_ref;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Every artifact this job holds a reference to, deduplicated. Pass-through
    /// pages share one artifact between source and rendered.
    pub fn artifact_refs(&self) -> Vec<ArtifactRef> {
        let mut refs: Vec<ArtifactRef> = Vec::with_capacity(self.pages.len() * 2 + 1);
        for page in &self.pages {
            refs.push(page.source_ref.clone());
            if let Some(ref rendered) = page.rendered_ref {
                refs.push(rendered.clone());
            }
        }
        if let Some(ref bundle) = self.bundle_ref {
            refs.push(bundle.clone());
        }
        refs.sort();
        refs.dedup();
        refs
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub title: Option<String>,
    pub source_language: Option<String>,
    pub page_count: Option<usize>,
    pub total_bytes: Option<u64>,
    pub pages_done: Option<usize>,
    pub pages_failed: Option<usize>,
    pub error: Option<Failure>,
    /// Set to Some(Some(ref)) to attach a bundle, Some(None) to clear it.
    pub bundle_ref: Option<Option<ArtifactRef>>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: Failure) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// A submission request as accepted by `POST /jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub source_kind: SourceKind,
    pub payload: SourcePayload,
    pub target_language: String,
    #[serde(default)]
    pub source_language: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Per-submission override of the configured failure policy.
    #[serde(default)]
    pub fail_fast: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourcePayload {
    Upload { files: Vec<UploadFile> },
    Remote { url: String },
    /// Multipart uploads the server has already streamed into the artifact
    /// store. Never accepted from clients.
    #[serde(skip)]
    Staged { files: Vec<StagedFile> },
}

impl SourcePayload {
    /// Artifacts holding staged uploads, owned by the submission until
    /// acquisition has copied them into pages.
    pub fn staged_refs(&self) -> Vec<ArtifactRef> {
        match self {
            SourcePayload::Staged { files } => files.iter().map(|f| f.artifact.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagedFile {
    pub name: String,
    pub content_type: Option<String>,
    pub artifact: ArtifactRef,
    pub len: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(with = "base64_data")]
    pub data: Vec<u8>,
}

mod base64_data {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.trim())
            .map_err(|e| serde::de::Error::custom(format!("invalid base64 data: {}", e)))
    }
}

/// Validate a NewJob before creation.
pub fn validate_new_job(job: &NewJob) -> Result<(), PipelineError> {
    match (&job.source_kind, &job.payload) {
        (SourceKind::UploadBatch, SourcePayload::Upload { files }) => {
            if files.is_empty() {
                return Err(PipelineError::Validation(
                    "Upload batch must contain at least one file".to_string(),
                ));
            }
            for file in files {
                if file.name.trim().is_empty() {
                    return Err(PipelineError::Validation(
                        "Uploaded file name cannot be empty".to_string(),
                    ));
                }
                if file.data.is_empty() {
                    return Err(PipelineError::Validation(format!(
                        "Uploaded file '{}' is empty",
                        file.name
                    )));
                }
            }
        }
        (SourceKind::UploadBatch, SourcePayload::Staged { files }) => {
            if files.is_empty() {
                return Err(PipelineError::Validation(
                    "Upload batch must contain at least one file".to_string(),
                ));
            }
            for file in files {
                if file.name.trim().is_empty() {
                    return Err(PipelineError::Validation(
                        "Uploaded file name cannot be empty".to_string(),
                    ));
                }
                if file.len == 0 {
                    return Err(PipelineError::Validation(format!(
                        "Uploaded file '{}' is empty",
                        file.name
                    )));
                }
            }
        }
        (SourceKind::RemoteUrl, SourcePayload::Remote { url }) => {
            let parsed = reqwest::Url::parse(url.trim())
                .map_err(|e| PipelineError::Validation(format!("Invalid URL '{}': {}", url, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(PipelineError::Validation(format!(
                    "Unsupported URL scheme '{}'",
                    parsed.scheme()
                )));
            }
        }
        (kind, _) => {
            return Err(PipelineError::Validation(format!(
                "Payload does not match source kind {:?}",
                kind
            )));
        }
    }

    if !is_language_code(&job.target_language) || job.target_language == AUTO_LANGUAGE {
        return Err(PipelineError::Validation(format!(
            "Invalid target language '{}'",
            job.target_language
        )));
    }
    if let Some(ref source) = job.source_language {
        if source != AUTO_LANGUAGE && !is_language_code(source) {
            return Err(PipelineError::Validation(format!(
                "Invalid source language '{}'",
                source
            )));
        }
    }
    if let Some(ref title) = job.title {
        if title.trim().is_empty() {
            return Err(PipelineError::Validation(
                "Title cannot be blank".to_string(),
            ));
        }
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(PipelineError::Validation(format!(
                "Title cannot exceed {} characters",
                MAX_TITLE_LEN
            )));
        }
    }

    Ok(())
}

/// BCP 47-ish: a 2-3 letter primary subtag followed by optional
/// alphanumeric subtags (`en`, `ja`, `zh-Hant`, `pt-BR`).
fn is_language_code(code: &str) -> bool {
    let mut parts = code.split('-');
    let primary = parts.next().unwrap_or_default();
    if !(2..=3).contains(&primary.len()) || !primary.chars().all(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    parts.all(|p| (1..=8).contains(&p.len()) && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Display title used until acquisition provides a better one.
pub fn derive_title(payload: &SourcePayload) -> String {
    match payload {
        SourcePayload::Upload { files } => {
            batch_title(files.iter().map(|f| (f.index, f.name.as_str())).collect())
        }
        SourcePayload::Staged { files } => {
            batch_title(files.iter().map(|f| (None, f.name.as_str())).collect())
        }
        SourcePayload::Remote { url } => match reqwest::Url::parse(url) {
            Ok(parsed) => parsed
                .path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
                .map(file_stem)
                .or_else(|| parsed.host_str().map(str::to_string))
                .unwrap_or_else(|| url.clone()),
            Err(_) => url.clone(),
        },
    }
}

/// Named after the file that becomes page 0.
fn batch_title(files: Vec<(Option<usize>, &str)>) -> String {
    let first = files
        .iter()
        .copied()
        .min_by(|a, b| upload_order(*a, *b))
        .map(|(_, name)| file_stem(name))
        .unwrap_or_default();
    match files.len() {
        0 | 1 => first,
        n => format!("{} (+{} more)", first, n - 1),
    }
}

pub fn file_stem(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => base.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Dashboard projection
// ---------------------------------------------------------------------------

/// The record the dashboard list renders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: Uuid,
    pub title: String,
    pub thumbnail_ref: Option<ArtifactRef>,
    pub pages: usize,
    pub language: String,
    pub date_created: DateTime<Utc>,
    pub status: JobStatus,
    pub size: u64,
    pub progress: f64,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            title: job.title.clone(),
            thumbnail_ref: job.thumbnail_ref().cloned(),
            pages: job.page_count,
            language: language_label(&job.source_language, &job.target_language),
            date_created: job.created_at,
            status: job.status,
            size: job.total_bytes,
            progress: job.progress(),
        }
    }
}

/// Human-readable pair such as "Japanese → English".
pub fn language_label(source: &str, target: &str) -> String {
    format!("{} → {}", language_name(source), language_name(target))
}

fn language_name(code: &str) -> String {
    let primary = code.split('-').next().unwrap_or(code).to_ascii_lowercase();
    let name = match primary.as_str() {
        "auto" => "Auto-detect",
        "ja" => "Japanese",
        "en" => "English",
        "zh" => "Chinese",
        "ko" => "Korean",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "it" => "Italian",
        "pt" => "Portuguese",
        "ru" => "Russian",
        "id" => "Indonesian",
        "vi" => "Vietnamese",
        "th" => "Thai",
        _ => return code.to_ascii_uppercase(),
    };
    name.to_string()
}
