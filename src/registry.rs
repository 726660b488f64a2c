// Job registry: read-only listing and search over the job table.

use std::sync::Arc;

use serde::Deserialize;

use crate::errors::PipelineError;
use crate::models::{Job, JobStatus, JobSummary};
use crate::storage::JobStore;

pub const DEFAULT_PER_PAGE: usize = 20;
pub const MAX_PER_PAGE: usize = 100;

/// Filters compose with AND. An empty filter matches every job.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Case-insensitive substring of the title.
    pub text_query: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        match self.text_query.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => job.title.to_lowercase().contains(&q.to_lowercase()),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
}

/// One-based page of results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: usize,
    pub per_page: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl Pagination {
    pub fn new(page: Option<usize>, per_page: Option<usize>) -> Result<Self, PipelineError> {
        let page = page.unwrap_or(1);
        let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE);
        if page == 0 {
            return Err(PipelineError::Validation("page starts at 1".to_string()));
        }
        if per_page == 0 || per_page > MAX_PER_PAGE {
            return Err(PipelineError::Validation(format!(
                "perPage must be between 1 and {}",
                MAX_PER_PAGE
            )));
        }
        Ok(Self { page, per_page })
    }

    fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.per_page)
    }
}

/// Projection of the job table for the dashboard. Never mutates anything.
pub struct JobRegistry {
    jobs: Arc<dyn JobStore>,
}

impl JobRegistry {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    /// Matching summaries for one page, plus the total number of matches.
    /// Ties on creation time are broken by id so paging is stable.
    pub async fn list(
        &self,
        filter: &JobFilter,
        order: SortOrder,
        pagination: Pagination,
    ) -> Result<(Vec<JobSummary>, usize), PipelineError> {
        let jobs = self
            .jobs
            .list_jobs()
            .await
            .map_err(PipelineError::from_store)?;

        let mut matching: Vec<Job> = jobs.into_iter().filter(|j| filter.matches(j)).collect();
        matching.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if order == SortOrder::Newest {
            matching.reverse();
        }

        let total = matching.len();
        let items = matching
            .iter()
            .skip(pagination.offset())
            .take(pagination.per_page)
            .map(JobSummary::from)
            .collect();
        Ok((items, total))
    }
}
