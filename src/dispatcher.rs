//! Creates job records and puts work on the queue.

use crate::broker::JobPublisher;
use crate::error::DispatchError;
use crate::job::{ImageJob, JobStatus, WorkMessage};
use crate::store::{JobStore, DEFAULT_LIST_LIMIT};
use std::sync::Arc;

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn JobPublisher>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, publisher: Arc<dyn JobPublisher>) -> Self {
        Self { store, publisher }
    }

    /// Writes a `pending` row, then publishes a [`WorkMessage`] for it.
    ///
    /// When the publish fails the row stays `pending` with nothing in flight and
    /// the id is returned inside [`DispatchError::Publish`].
    pub async fn create_and_enqueue(
        &self,
        filename: &str,
        original_size: i64,
    ) -> Result<i64, DispatchError> {
        let job_id = self.store.create_job(filename, original_size).await?;

        if let Err(source) = self.publisher.publish(&WorkMessage::new(job_id, filename)).await {
            log::error!("Error publishing job {} for {}: {}", job_id, filename, source);
            return Err(DispatchError::Publish { job_id, source });
        }

        log::info!(
            "Enqueued upload {}, size: {} bytes, job ID: {}",
            filename,
            original_size,
            job_id
        );
        Ok(job_id)
    }

    /// Puts a `failed` job back on the queue.
    ///
    /// The row is set to `pending` before publishing. If the publish fails only
    /// its status goes back to `failed`, keeping the last processing error, so
    /// it is never left `pending` without a message.
    /// The two writes are not atomic with the publish; a crash between them can
    /// still leave a `pending` row behind.
    pub async fn retry(&self, job_id: i64) -> Result<(), DispatchError> {
        let job = self.store.get_job(job_id).await?;
        if !job.status.can_transition_to(JobStatus::Pending) {
            log::warn!("Only failed jobs can be retried, job {} is {}", job_id, job.status);
            return Err(DispatchError::InvalidState {
                id: job_id,
                status: job.status,
            });
        }

        self.store.set_status(job_id, JobStatus::Pending).await?;

        if let Err(source) = self
            .publisher
            .publish(&WorkMessage::new(job_id, job.filename.as_str()))
            .await
        {
            log::error!("Error publishing retry of job {}: {}", job_id, source);
            if let Err(e) = self.store.set_status(job_id, JobStatus::Failed).await {
                log::error!("Failed to revert job {} to failed: {}", job_id, e);
            }
            return Err(DispatchError::Publish { job_id, source });
        }

        log::info!("Job {} requeued for retry", job_id);
        Ok(())
    }

    pub async fn get_job(&self, job_id: i64) -> Result<ImageJob, DispatchError> {
        Ok(self.store.get_job(job_id).await?)
    }

    /// Newest first. `limit` defaults to 100.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<ImageJob>, DispatchError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let jobs = match status {
            Some(status) => self.store.list_jobs_by_status(status, limit).await?,
            None => self.store.list_jobs(limit).await?,
        };
        Ok(jobs)
    }
}
