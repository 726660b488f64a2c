pub mod artifacts;
pub mod jobs;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::models::{ArtifactRef, Job, JobUpdate, Page, PageUpdate};

pub use artifacts::FsArtifactStore;
pub use jobs::JsonJobStore;

/// The job/page table. Every mutation runs under a single store lock and is
/// validated against the status state machines before it is applied.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// All jobs, each with its pages in index order.
    async fn list_jobs(&self) -> Result<Vec<Job>>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
    async fn create_job(&self, job: Job) -> Result<Job>;
    async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<Job>;
    /// Insert the pages of a freshly acquired job and apply `update` to the
    /// job record in the same step. Fails if the job already has pages.
    async fn materialize_pages(&self, id: Uuid, pages: Vec<Page>, update: JobUpdate)
        -> Result<Job>;
    async fn get_page(&self, id: Uuid, index: usize) -> Result<Option<Page>>;
    async fn update_page(&self, id: Uuid, index: usize, update: PageUpdate) -> Result<Page>;
    /// Remove a job and its pages, returning what was removed. Deleting an
    /// unknown id is not an error.
    async fn delete_job(&self, id: Uuid) -> Result<Option<Job>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMeta {
    pub content_type: String,
    pub len: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub meta: ArtifactMeta,
    pub bytes: Vec<u8>,
}

pub struct ArtifactReader {
    pub meta: ArtifactMeta,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

/// Durable byte storage addressed by opaque refs. An artifact becomes
/// visible only once completely written.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>, content_type: &str) -> Result<ArtifactRef>;
    /// Store everything `reader` yields. Stores that can write incrementally
    /// override this; the default buffers the whole stream.
    async fn put_stream(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<ArtifactRef> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .await
            .context("Failed to read artifact stream")?;
        self.put(bytes, content_type).await
    }
    async fn get(&self, artifact: &ArtifactRef) -> Result<Option<Artifact>>;
    async fn open(&self, artifact: &ArtifactRef) -> Result<Option<ArtifactReader>>;
    async fn stat(&self, artifact: &ArtifactRef) -> Result<Option<ArtifactMeta>>;
    /// Idempotent: deleting a missing ref succeeds.
    async fn delete(&self, artifact: &ArtifactRef) -> Result<()>;
    async fn list_refs(&self) -> Result<Vec<ArtifactRef>>;
}
