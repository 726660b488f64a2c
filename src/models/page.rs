use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::{ArtifactRef, Failure};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Pending,
    Extracting,
    Translating,
    Composing,
    Done,
    Failed,
}

impl PageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PageStatus::Done | PageStatus::Failed)
    }

    /// Legal page transitions. In-progress stages may fall back to `Pending`
    /// when the coordinator requeues the page after a storage outage.
    pub fn can_transition_to(self, next: PageStatus) -> bool {
        use PageStatus::*;
        matches!(
            (self, next),
            (Pending, Extracting)
                | (Pending, Failed)
                | (Extracting, Translating)
                | (Extracting, Done)
                | (Extracting, Failed)
                | (Extracting, Pending)
                | (Translating, Composing)
                | (Translating, Failed)
                | (Translating, Pending)
                | (Composing, Done)
                | (Composing, Failed)
                | (Composing, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PageStatus::Pending => "pending",
            PageStatus::Extracting => "extracting",
            PageStatus::Translating => "translating",
            PageStatus::Composing => "composing",
            PageStatus::Done => "done",
            PageStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which image of a page a reader asks for.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PageVariant {
    #[default]
    Rendered,
    Source,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub job_id: Uuid,
    pub index: usize,
    pub source_ref: ArtifactRef,
    #[serde(default)]
    pub rendered_ref: Option<ArtifactRef>,
    pub status: PageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    pub source_bytes: u64,
    #[serde(default)]
    pub rendered_bytes: u64,
    #[serde(default)]
    pub region_count: usize,
    #[serde(default)]
    pub regions_translated: usize,
    #[serde(default)]
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl Page {
    pub fn new(job_id: Uuid, index: usize, source_ref: ArtifactRef, source_bytes: u64) -> Self {
        Self {
            job_id,
            index,
            source_ref,
            rendered_ref: None,
            status: PageStatus::Pending,
            error: None,
            source_bytes,
            rendered_bytes: 0,
            region_count: 0,
            regions_translated: 0,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    /// Apply an update, rejecting illegal transitions and any attempt to set
    /// `renderedRef` other than once, together with the move to `Done`.
    pub fn apply(&mut self, update: PageUpdate) -> Result<(), PipelineError> {
        let next = update.status.unwrap_or(self.status);
        if next != self.status && !self.status.can_transition_to(next) {
            return Err(PipelineError::Internal(format!(
                "illegal page transition {} -> {} for page {} of job {}",
                self.status, next, self.index, self.job_id
            )));
        }

        if update.rendered_ref.is_some() {
            if self.rendered_ref.is_some() {
                return Err(PipelineError::Internal(format!(
                    "page {} of job {} already has a rendered artifact",
                    self.index, self.job_id
                )));
            }
            if update.status != Some(PageStatus::Done) {
                return Err(PipelineError::Internal(
                    "renderedRef can only be set with the transition to done".to_string(),
                ));
            }
        }
        if next == PageStatus::Done && self.rendered_ref.is_none() && update.rendered_ref.is_none()
        {
            return Err(PipelineError::Internal(format!(
                "page {} of job {} cannot be done without a rendered artifact",
                self.index, self.job_id
            )));
        }
        if next == PageStatus::Failed && update.error.is_none() && self.error.is_none() {
            return Err(PipelineError::Internal(format!(
                "page {} of job {} cannot fail without an error",
                self.index, self.job_id
            )));
        }

        if next == PageStatus::Pending && self.status != PageStatus::Pending {
            self.region_count = 0;
            self.regions_translated = 0;
        }
        self.status = next;
        if let Some(rendered_ref) = update.rendered_ref {
            self.rendered_ref = Some(rendered_ref);
        }
        if let Some(bytes) = update.rendered_bytes {
            self.rendered_bytes = bytes;
        }
        if let Some(count) = update.region_count {
            self.region_count = count;
        }
        if let Some(count) = update.regions_translated {
            self.regions_translated = count;
        }
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PageUpdate {
    pub status: Option<PageStatus>,
    pub rendered_ref: Option<ArtifactRef>,
    pub rendered_bytes: Option<u64>,
    pub region_count: Option<usize>,
    pub regions_translated: Option<usize>,
    pub attempts: Option<u32>,
    pub error: Option<Failure>,
}

impl PageUpdate {
    pub fn status(status: PageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: Failure) -> Self {
        Self {
            status: Some(PageStatus::Failed),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn done(rendered_ref: ArtifactRef, rendered_bytes: u64) -> Self {
        Self {
            status: Some(PageStatus::Done),
            rendered_ref: Some(rendered_ref),
            rendered_bytes: Some(rendered_bytes),
            ..Default::default()
        }
    }
}
