//! Per-message processing state machine.
//!
//! ```text
//! Received -> Validated -> Processing -> Compressed -> Delivered -> Acked
//!     |           |            |              |            |
//!     +-----------+------------+--------------+------------+--> RetriedViaNack | Rejected
//! ```
//!
//! [`JobProcessor::process`] never touches the broker. It returns the one
//! [`Disposition`] the caller must apply to the delivery, having already made a
//! best-effort update to the job row.

use crate::compress::{Compressed, Compressor};
use crate::death::DeathHistory;
use crate::error::{CompressionError, StoreError};
use crate::job::{compressed_file_name, ImageJob, JobStatus, WorkMessage};
use crate::store::JobStore;
use crate::transfer::BlobTransfer;
use std::fmt;
use std::sync::Arc;

/// Deliveries whose prior attempt count reaches this are moved to the failed queue.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

pub const MAX_RETRY_MESSAGE: &str = "max retry reached";

/// Step of the pipeline a delivery failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    AttemptCheck,
    Resolve,
    Fetch,
    Compress,
    Deliver,
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Decode => "decode",
            Stage::AttemptCheck => "attempt-check",
            Stage::Resolve => "resolve",
            Stage::Fetch => "fetch",
            Stage::Compress => "compress",
            Stage::Deliver => "deliver",
            Stage::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// The single broker action that ends a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Positive acknowledgement. Only after the job row reached `completed`.
    Ack,
    /// Reject without requeue so the main queue's dead-letter binding sends the
    /// message through the delay queue and back.
    Retry { stage: Stage, reason: String },
    /// Never retried again. Moved to the failed queue.
    DeadLetter { stage: Stage, reason: String },
}

impl Disposition {
    fn retry(stage: Stage, reason: impl Into<String>) -> Self {
        Disposition::Retry {
            stage,
            reason: reason.into(),
        }
    }

    /// Why the job did not complete, `None` for [`Disposition::Ack`].
    pub fn reason(&self) -> Option<&str> {
        match self {
            Disposition::Ack => None,
            Disposition::Retry { reason, .. } | Disposition::DeadLetter { reason, .. } => {
                Some(reason.as_str())
            }
        }
    }
}

/// Runs Compressor and BlobTransfer for one job and keeps its row in step.
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    transfer: Arc<dyn BlobTransfer>,
    compressor: Compressor,
    retry_limit: u32,
}

impl JobProcessor {
    pub fn new(store: Arc<dyn JobStore>, transfer: Arc<dyn BlobTransfer>) -> Self {
        Self {
            store,
            transfer,
            compressor: Compressor::default(),
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    pub fn with_compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub async fn process(&self, body: &[u8], deaths: &DeathHistory) -> Disposition {
        // The id in an undecodable body cannot be trusted, so the store is left alone.
        let message: WorkMessage = match serde_json::from_slice(body) {
            Ok(message) => message,
            Err(e) => {
                log::error!("Failed to parse work message, moving it to the failed queue: {}", e);
                return Disposition::DeadLetter {
                    stage: Stage::Decode,
                    reason: format!("malformed message: {}", e),
                };
            }
        };

        let attempts = deaths.attempts();
        if attempts >= self.retry_limit {
            log::warn!(
                "Job ID {} reached max retries ({} of {}), moving it to the failed queue",
                message.id,
                attempts,
                self.retry_limit
            );
            self.record_failure(message.id, MAX_RETRY_MESSAGE).await;
            return Disposition::DeadLetter {
                stage: Stage::AttemptCheck,
                reason: MAX_RETRY_MESSAGE.to_string(),
            };
        }

        log::info!("Processing job ID {} (prior attempts: {})", message.id, attempts);
        let disposition = self.run(&message).await;
        match &disposition {
            Disposition::Ack => log::info!("Successfully processed job {}", message.id),
            Disposition::Retry { stage, reason } => log::warn!(
                "Job ID {} failed at {} (attempt {}), retrying via delay queue: {}",
                message.id,
                stage,
                attempts + 1,
                reason
            ),
            Disposition::DeadLetter { .. } => {}
        }
        disposition
    }

    async fn run(&self, message: &WorkMessage) -> Disposition {
        let id = message.id;

        if let Err(e) = self.store.set_status(id, JobStatus::Processing).await {
            log::warn!("Failed to mark job {} as processing, continuing: {}", id, e);
        }

        let job = match self.resolve(message).await {
            Ok(job) => job,
            Err(e) => return self.fail(id, Stage::Resolve, format!("DB error: {}", e)).await,
        };

        let original = match self.transfer.fetch_original(&job.filename).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return self
                    .fail(id, Stage::Fetch, format!("failed to fetch image from provider: {}", e))
                    .await
            }
        };

        let compressed = match self.compress(original).await {
            Ok(compressed) => compressed,
            Err(e) => return self.fail(id, Stage::Compress, format!("compression error: {}", e)).await,
        };

        let output_name = compressed_file_name(&job.filename);
        if let Err(e) = self
            .transfer
            .push_compressed(&output_name, compressed.bytes)
            .await
        {
            return self
                .fail(id, Stage::Deliver, format!("failed to upload compressed image: {}", e))
                .await;
        }

        // Ack only once this write has landed; otherwise redelivery repeats the job.
        if let Err(e) = self.store.mark_completed(id, compressed.size, &output_name).await {
            log::error!("Failed to mark job {} as completed, leaving it for redelivery: {}", id, e);
            return Disposition::retry(Stage::Finalize, format!("DB error: {}", e));
        }

        Disposition::Ack
    }

    /// Re-reads the row so a stale or forged body cannot pick the file.
    async fn resolve(&self, message: &WorkMessage) -> Result<ImageJob, StoreError> {
        let job = self.store.get_job(message.id).await?;
        if job.filename != message.filename {
            log::warn!(
                "Job ID {} message names '{}' but the stored row has '{}', using the stored row",
                message.id,
                message.filename,
                job.filename
            );
        }
        Ok(job)
    }

    async fn compress(&self, original: Vec<u8>) -> Result<Compressed, CompressionError> {
        let compressor = self.compressor;
        tokio::task::spawn_blocking(move || {
            let format = Compressor::detect_format(&original)?;
            compressor.compress(&original, format)
        })
        .await
        .map_err(|e| CompressionError::Aborted(e.to_string()))?
    }

    async fn fail(&self, id: i64, stage: Stage, reason: String) -> Disposition {
        self.record_failure(id, &reason).await;
        Disposition::retry(stage, reason)
    }

    /// Best effort. A redelivery repeats the same write.
    async fn record_failure(&self, id: i64, reason: &str) {
        if let Err(e) = self.store.mark_failed(id, reason).await {
            log::error!("Failed to mark job {} as failed: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::death::DeathRecord;
    use crate::error::TransferError;
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl BlobTransfer for Unreachable {
        async fn fetch_original(&self, filename: &str) -> Result<Vec<u8>, TransferError> {
            Err(TransferError::Status {
                method: "GET",
                url: format!("http://blobs/images-uploaded/{}", filename),
                status: 404,
            })
        }

        async fn push_compressed(&self, _: &str, _: Vec<u8>) -> Result<(), TransferError> {
            unreachable!("nothing to push when fetch fails")
        }
    }

    fn processor(store: Arc<MemoryJobStore>) -> JobProcessor {
        JobProcessor::new(store, Arc::new(Unreachable))
    }

    fn deaths(count: u32) -> DeathHistory {
        DeathHistory::from_records(vec![DeathRecord::new("image_jobs", "rejected", count)])
    }

    #[tokio::test]
    async fn test_malformed_body_is_dead_lettered_without_store_writes() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store.create_job("a.jpg", 1).await.unwrap();

        let disposition = processor(store.clone())
            .process(b"{\"id\": \"one\"}", &DeathHistory::default())
            .await;

        assert!(matches!(
            disposition,
            Disposition::DeadLetter { stage: Stage::Decode, .. }
        ));
        assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_attempt_limit_marks_failed_and_dead_letters() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store.create_job("a.jpg", 1).await.unwrap();
        let body = serde_json::to_vec(&WorkMessage::new(id, "a.jpg")).unwrap();

        let disposition = processor(store.clone()).process(&body, &deaths(3)).await;

        assert_eq!(
            disposition,
            Disposition::DeadLetter {
                stage: Stage::AttemptCheck,
                reason: MAX_RETRY_MESSAGE.to_string()
            }
        );
        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(MAX_RETRY_MESSAGE));
    }

    #[tokio::test]
    async fn test_custom_retry_limit() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store.create_job("a.jpg", 1).await.unwrap();
        let body = serde_json::to_vec(&WorkMessage::new(id, "a.jpg")).unwrap();

        let processor = processor(store.clone()).with_retry_limit(1);
        assert!(matches!(
            processor.process(&body, &deaths(1)).await,
            Disposition::DeadLetter { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_job_goes_through_retry_path() {
        let store = Arc::new(MemoryJobStore::new());
        let body = serde_json::to_vec(&WorkMessage::new(404, "ghost.jpg")).unwrap();

        let disposition = processor(store).process(&body, &DeathHistory::default()).await;

        match disposition {
            Disposition::Retry { stage, reason } => {
                assert_eq!(stage, Stage::Resolve);
                assert!(reason.contains("not found"), "{}", reason);
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_failure_marks_failed_and_retries() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store.create_job("a.jpg", 1).await.unwrap();
        let body = serde_json::to_vec(&WorkMessage::new(id, "a.jpg")).unwrap();

        let disposition = processor(store.clone()).process(&body, &deaths(0)).await;

        assert!(matches!(disposition, Disposition::Retry { stage: Stage::Fetch, .. }));
        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job
            .error_message
            .unwrap()
            .starts_with("failed to fetch image from provider"));
    }
}
