use super::JobStore;
use crate::error::StoreError;
use crate::job::{ImageJob, JobStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-process [`JobStore`] for local runs and tests. Same semantics as the
/// Postgres store, nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    jobs: BTreeMap<i64, ImageJob>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, id: i64, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut ImageJob),
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        f(job);
        job.updated_at = Utc::now();
        Ok(())
    }

    fn newest_first<'a>(jobs: impl Iterator<Item = &'a ImageJob>, limit: i64) -> Vec<ImageJob> {
        let mut jobs: Vec<ImageJob> = jobs.cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, filename: &str, original_size: i64) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = inner.next_id;
        let now = Utc::now();
        inner.jobs.insert(
            id,
            ImageJob {
                id,
                filename: filename.to_string(),
                original_size,
                compressed_size: None,
                compressed_file_name: None,
                status: JobStatus::Pending,
                error_message: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get_job(&self, id: i64) -> Result<ImageJob, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.jobs.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<ImageJob>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Self::newest_first(inner.jobs.values(), limit))
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<ImageJob>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Self::newest_first(
            inner.jobs.values().filter(|job| job.status == status),
            limit,
        ))
    }

    async fn set_status(&self, id: i64, status: JobStatus) -> Result<(), StoreError> {
        self.update(id, |job| {
            job.status = status;
            job.compressed_size = None;
            job.compressed_file_name = None;
        })
    }

    async fn mark_failed(&self, id: i64, message: &str) -> Result<(), StoreError> {
        self.update(id, |job| {
            job.status = JobStatus::Failed;
            job.error_message = Some(message.to_string());
            job.compressed_size = None;
            job.compressed_file_name = None;
        })
    }

    async fn mark_completed(
        &self,
        id: i64,
        compressed_size: i64,
        compressed_file_name: &str,
    ) -> Result<(), StoreError> {
        self.update(id, |job| {
            job.status = JobStatus::Completed;
            job.compressed_size = Some(compressed_size);
            job.compressed_file_name = Some(compressed_file_name.to_string());
            job.error_message = None;
        })
    }
}
