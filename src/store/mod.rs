//! Durable record of each job's lifecycle state.

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use crate::error::StoreError;
use crate::job::{ImageJob, JobStatus};
use async_trait::async_trait;

/// Default page size for listing queries.
pub const DEFAULT_LIST_LIMIT: i64 = 100;

/// CRUD operations the dispatcher and the worker need from the job store.
///
/// Every mutation bumps `updated_at`. Status changes other than
/// [`mark_completed`](JobStore::mark_completed) clear the compressed outputs so that
/// they are only ever present on a completed row.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a `pending` row and returns its id.
    async fn create_job(&self, filename: &str, original_size: i64) -> Result<i64, StoreError>;

    /// Fails with [`StoreError::NotFound`] when the row does not exist.
    async fn get_job(&self, id: i64) -> Result<ImageJob, StoreError>;

    /// Most recent jobs first.
    async fn list_jobs(&self, limit: i64) -> Result<Vec<ImageJob>, StoreError>;

    /// Most recent jobs in `status` first.
    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<ImageJob>, StoreError>;

    /// Sets `status`, leaving `error_message` as it was.
    async fn set_status(&self, id: i64, status: JobStatus) -> Result<(), StoreError>;

    /// Sets status `failed` and records `message` as the last failure.
    async fn mark_failed(&self, id: i64, message: &str) -> Result<(), StoreError>;

    /// Sets status `completed` with its outputs and clears `error_message`.
    async fn mark_completed(
        &self,
        id: i64,
        compressed_size: i64,
        compressed_file_name: &str,
    ) -> Result<(), StoreError>;
}
