
use crate::job::JobStatus;
use thiserror::Error;

/// Top-level error type for the worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// A queue or exchange could not be declared, usually because it already
    /// exists with different arguments. Fatal at startup.
    #[error("Failed to declare {entity}: {source}")]
    Topology {
        entity: String,
        #[source]
        source: lapin::Error,
    },

    /// Job store failure outside of message processing (startup, schema).
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    /// Messaging setup or configuration error.
    #[error("Messaging setup or configuration error: {message}")]
    Config { message: String },
}

impl WorkerError {
    /// Errors that reconnecting cannot fix: a topology declared elsewhere with
    /// different arguments, or bad settings.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::Topology { .. } | WorkerError::Config { .. })
    }
}

impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::Config { message: s.to_string() }
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::Config { message: s }
    }
}

/// Errors raised by a [`JobStore`](crate::store::JobStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("image job {0} not found")]
    NotFound(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row was read that violates the job record invariants.
    #[error("corrupt image job row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },
}

/// Errors raised by a [`BlobTransfer`](crate::transfer::BlobTransfer).
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{method} {url} returned {status}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid blob URL: {0}")]
    InvalidUrl(String),
}

/// Errors raised while decoding, resizing or re-encoding an image.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("image of height {height} cannot be halved")]
    TooSmall { height: u32 },

    #[error("compression task aborted: {0}")]
    Aborted(String),
}

/// Errors raised when publishing a [`WorkMessage`](crate::job::WorkMessage).
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("broker refused the message")]
    Nacked,

    #[error("failed to encode work message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors surfaced to callers of the [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Only `failed` jobs can be retried.
    #[error("image job {id} is {status}, only failed jobs can be retried")]
    InvalidState { id: i64, status: JobStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The job row exists but no message is in flight for it.
    #[error("failed to publish image job {job_id}: {source}")]
    Publish {
        job_id: i64,
        #[source]
        source: PublishError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_and_config_errors_are_fatal() {
        let mismatch = WorkerError::Topology {
            entity: "queue 'image_jobs'".to_string(),
            source: lapin::Error::ChannelsLimitReached,
        };
        assert!(mismatch.is_fatal());
        assert!(WorkerError::from("RabbitMQ URL cannot be empty").is_fatal());
    }

    #[test]
    fn test_connection_errors_are_retried() {
        assert!(!WorkerError::Lapin(lapin::Error::ChannelsLimitReached).is_fatal());
        assert!(!WorkerError::Store(StoreError::NotFound(1)).is_fatal());
    }
}
