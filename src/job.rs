//! The persisted job record and the message that points at it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix given to the stored name of every compressed result.
pub const COMPRESSED_PREFIX: &str = "compressed_";

/// Lifecycle state of an [`ImageJob`].
///
/// A job moves `pending -> processing -> {completed, failed}`. A failed job
/// re-enters `processing` when the broker redelivers it after the retry delay,
/// and goes back to `pending` only through an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether a job may move from `self` to `next`.
    ///
    /// `processing -> processing` is a redelivery of a job whose worker died or
    /// could not record the outcome. `failed -> failed` is the attempt limit
    /// being recorded on a row the previous attempt already failed.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Failed, JobStatus::Processing)
                | (JobStatus::Failed, JobStatus::Failed)
                | (JobStatus::Failed, JobStatus::Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Durable record of one uploaded image and its compression lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageJob {
    pub id: i64,
    pub filename: String,
    pub original_size: i64,
    pub compressed_size: Option<i64>,
    pub compressed_file_name: Option<String>,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageJob {
    /// The compressed outputs are present if and only if the job completed.
    pub fn is_consistent(&self) -> bool {
        let has_output = self.compressed_size.is_some() && self.compressed_file_name.is_some();
        let has_none = self.compressed_size.is_none() && self.compressed_file_name.is_none();
        if self.status == JobStatus::Completed {
            has_output
        } else {
            has_none
        }
    }
}

/// Name under which the compressed version of `filename` is delivered.
pub fn compressed_file_name(filename: &str) -> String {
    format!("{}{}", COMPRESSED_PREFIX, filename)
}

/// Body of a message on the main queue. A pointer to a job row, not a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMessage {
    pub id: i64,
    pub filename: String,
}

impl WorkMessage {
    pub fn new(id: i64, filename: impl Into<String>) -> Self {
        Self {
            id,
            filename: filename.into(),
        }
    }
}
