use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::{Job, JobUpdate, Page, PageUpdate};
use crate::storage::JobStore;

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    pages: BTreeMap<(Uuid, usize), Page>,
}

impl Tables {
    fn pages_of(&self, id: Uuid) -> impl Iterator<Item = &Page> {
        self.pages.range((id, 0)..=(id, usize::MAX)).map(|(_, p)| p)
    }

    fn assemble(&self, job: &Job) -> Job {
        let mut full = job.clone();
        full.pages = self.pages_of(job.id).cloned().collect();
        full
    }
}

#[derive(Deserialize)]
struct Snapshot {
    #[serde(default)]
    jobs: Vec<Job>,
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    jobs: Vec<&'a Job>,
    pages: Vec<&'a Page>,
}

pub struct JsonJobStore {
    file_path: PathBuf,
    cache: RwLock<Tables>,
}

impl JsonJobStore {
    /// Create a new JsonJobStore, loading existing data from disk if present.
    ///
    /// If `jobs.json` is corrupted (invalid JSON), creates a backup at
    /// `jobs.json.bak`, logs a warning, and starts with an empty table.
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .context("Failed to create data directory")?;

        let file_path = data_dir.join("jobs.json");

        let mut tables = Tables::default();
        if file_path.exists() {
            let content = tokio::fs::read_to_string(&file_path)
                .await
                .context("Failed to read jobs.json")?;
            match serde_json::from_str::<Snapshot>(&content) {
                Ok(snapshot) => {
                    for mut job in snapshot.jobs {
                        job.pages.clear();
                        tables.jobs.insert(job.id, job);
                    }
                    for page in snapshot.pages {
                        if tables.jobs.contains_key(&page.job_id) {
                            tables.pages.insert((page.job_id, page.index), page);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "jobs.json is corrupted ({}), creating backup and starting empty",
                        e
                    );
                    let backup_path = data_dir.join("jobs.json.bak");
                    if let Err(backup_err) = tokio::fs::copy(&file_path, &backup_path).await {
                        tracing::error!(
                            "Failed to create backup of corrupted jobs.json: {}",
                            backup_err
                        );
                    }
                }
            }
        }

        Ok(Self {
            file_path,
            cache: RwLock::new(tables),
        })
    }

    /// Atomically write the tables to disk.
    /// Writes to a .tmp file first, then renames to the actual file.
    async fn persist(&self, tables: &Tables) -> Result<()> {
        let tmp_path = self.file_path.with_extension("json.tmp");

        let mut jobs: Vec<&Job> = tables.jobs.values().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        let snapshot = SnapshotRef {
            jobs,
            pages: tables.pages.values().collect(),
        };
        let json = serde_json::to_vec(&snapshot).context("Failed to serialize jobs")?;

        tokio::fs::write(&tmp_path, &json)
            .await
            .context("Failed to write temporary jobs file")?;

        tokio::fs::rename(&tmp_path, &self.file_path)
            .await
            .context("Failed to rename temporary jobs file")?;

        Ok(())
    }
}

fn job_not_found(id: Uuid) -> anyhow::Error {
    PipelineError::NotFound(format!("Job with id '{}' not found", id)).into()
}

#[async_trait]
impl JobStore for JsonJobStore {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let cache = self.cache.read().await;
        Ok(cache.jobs.values().map(|j| cache.assemble(j)).collect())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let cache = self.cache.read().await;
        Ok(cache.jobs.get(&id).map(|j| cache.assemble(j)))
    }

    async fn create_job(&self, mut job: Job) -> Result<Job> {
        let mut cache = self.cache.write().await;

        if cache.jobs.contains_key(&job.id) {
            return Err(
                PipelineError::Internal(format!("Job with id '{}' already exists", job.id)).into(),
            );
        }

        job.pages.clear();
        cache.jobs.insert(job.id, job.clone());
        if let Err(e) = self.persist(&cache).await {
            cache.jobs.remove(&job.id);
            return Err(e);
        }

        Ok(job)
    }

    async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<Job> {
        let mut cache = self.cache.write().await;

        let job = cache.jobs.get_mut(&id).ok_or_else(|| job_not_found(id))?;
        let previous = job.clone();
        job.apply(update)?;

        if let Err(e) = self.persist(&cache).await {
            cache.jobs.insert(id, previous);
            return Err(e);
        }

        let job = cache.jobs.get(&id).ok_or_else(|| job_not_found(id))?;
        Ok(cache.assemble(job))
    }

    async fn materialize_pages(
        &self,
        id: Uuid,
        pages: Vec<Page>,
        update: JobUpdate,
    ) -> Result<Job> {
        let mut cache = self.cache.write().await;

        if !cache.jobs.contains_key(&id) {
            return Err(job_not_found(id));
        }
        if cache.pages_of(id).next().is_some() {
            return Err(
                PipelineError::Internal(format!("Job '{}' already has pages", id)).into(),
            );
        }
        for (expected, page) in pages.iter().enumerate() {
            if page.job_id != id || page.index != expected {
                return Err(PipelineError::Internal(format!(
                    "Page {} does not belong at index {} of job '{}'",
                    page.index, expected, id
                ))
                .into());
            }
        }

        let job = cache.jobs.get_mut(&id).ok_or_else(|| job_not_found(id))?;
        let previous = job.clone();
        job.apply(update)?;
        for page in pages {
            cache.pages.insert((id, page.index), page);
        }

        if let Err(e) = self.persist(&cache).await {
            cache.jobs.insert(id, previous);
            let keys: Vec<_> = cache.pages_of(id).map(|p| (p.job_id, p.index)).collect();
            for key in keys {
                cache.pages.remove(&key);
            }
            return Err(e);
        }

        let job = cache.jobs.get(&id).ok_or_else(|| job_not_found(id))?;
        Ok(cache.assemble(job))
    }

    async fn get_page(&self, id: Uuid, index: usize) -> Result<Option<Page>> {
        let cache = self.cache.read().await;
        Ok(cache.pages.get(&(id, index)).cloned())
    }

    async fn update_page(&self, id: Uuid, index: usize, update: PageUpdate) -> Result<Page> {
        let mut cache = self.cache.write().await;

        let page = cache.pages.get_mut(&(id, index)).ok_or_else(|| {
            PipelineError::NotFound(format!("Page {} of job '{}' not found", index, id))
        })?;
        let previous = page.clone();
        page.apply(update)?;
        let updated = page.clone();

        if let Err(e) = self.persist(&cache).await {
            cache.pages.insert((id, index), previous);
            return Err(e);
        }

        Ok(updated)
    }

    async fn delete_job(&self, id: Uuid) -> Result<Option<Job>> {
        let mut cache = self.cache.write().await;

        let Some(job) = cache.jobs.get(&id) else {
            return Ok(None);
        };
        let removed = cache.assemble(job);
        cache.jobs.remove(&id);
        for page in &removed.pages {
            cache.pages.remove(&(id, page.index));
        }

        if let Err(e) = self.persist(&cache).await {
            let mut record = removed.clone();
            for page in std::mem::take(&mut record.pages) {
                cache.pages.insert((id, page.index), page);
            }
            cache.jobs.insert(id, record);
            return Err(e);
        }

        Ok(Some(removed))
    }
}
