use super::JobStore;
use crate::error::StoreError;
use crate::job::{ImageJob, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

const SELECT_COLUMNS: &str = "SELECT id, filename, original_size, compressed_size, compressed_file_name, \
     status, error_message, created_at, updated_at FROM image_jobs";

const CREATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS image_jobs (
        id                   BIGSERIAL PRIMARY KEY,
        filename             TEXT        NOT NULL,
        original_size        BIGINT      NOT NULL,
        compressed_size      BIGINT,
        compressed_file_name TEXT,
        status               TEXT        NOT NULL DEFAULT 'pending',
        error_message        TEXT,
        created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at           TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    filename: String,
    original_size: i64,
    compressed_size: Option<i64>,
    compressed_file_name: Option<String>,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for ImageJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|reason| StoreError::CorruptRow { id: row.id, reason })?;

        Ok(ImageJob {
            id: row.id,
            filename: row.filename,
            original_size: row.original_size,
            compressed_size: row.compressed_size,
            compressed_file_name: row.compressed_file_name,
            status,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// [`JobStore`] backed by the `image_jobs` table in Postgres.
#[derive(Clone, Debug)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Creates the `image_jobs` table when it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn expect_one(id: i64, rows_affected: u64) -> Result<(), StoreError> {
        if rows_affected == 0 {
            Err(StoreError::NotFound(id))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, filename: &str, original_size: i64) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO image_jobs (filename, original_size, status) VALUES ($1, $2, 'pending') RETURNING id",
        )
        .bind(filename)
        .bind(original_size)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_job(&self, id: i64) -> Result<ImageJob, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        row.try_into()
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<ImageJob>, StoreError> {
        sqlx::query_as::<_, JobRow>(&format!("{} ORDER BY created_at DESC LIMIT $1", SELECT_COLUMNS))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ImageJob::try_from)
            .collect()
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<ImageJob>, StoreError> {
        sqlx::query_as::<_, JobRow>(&format!(
            "{} WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
            SELECT_COLUMNS
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ImageJob::try_from)
        .collect()
    }

    async fn set_status(&self, id: i64, status: JobStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE image_jobs
            SET status = $2, compressed_size = NULL, compressed_file_name = NULL, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Self::expect_one(id, result.rows_affected())
    }

    async fn mark_failed(&self, id: i64, message: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE image_jobs
            SET status = 'failed', error_message = $2,
                compressed_size = NULL, compressed_file_name = NULL, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Self::expect_one(id, result.rows_affected())
    }

    async fn mark_completed(
        &self,
        id: i64,
        compressed_size: i64,
        compressed_file_name: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE image_jobs
            SET status = 'completed', compressed_size = $2, compressed_file_name = $3,
                error_message = NULL, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(compressed_size)
        .bind(compressed_file_name)
        .execute(&self.pool)
        .await?;
        Self::expect_one(id, result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str) -> JobRow {
        JobRow {
            id: 7,
            filename: "a.jpg".into(),
            original_size: 10,
            compressed_size: None,
            compressed_file_name: None,
            status: status.into(),
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_with_known_status_converts() {
        let job = ImageJob::try_from(row("failed")).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.id, 7);
    }

    #[test]
    fn test_row_with_unknown_status_is_corrupt() {
        let err = ImageJob::try_from(row("archived")).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { id: 7, .. }));
    }
}
