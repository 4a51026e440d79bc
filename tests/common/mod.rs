#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use image_compress_worker::{
    BlobTransfer, DeathHistory, DeathRecord, ImageJob, JobPublisher, JobStatus, JobStore,
    MemoryJobStore, PublishError, StoreError, TransferError, WorkMessage,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Encodes a gradient of the given size.
pub fn encoded_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img).write_to(&mut out, format).unwrap();
    out.into_inner()
}

pub fn body(message: &WorkMessage) -> Vec<u8> {
    serde_json::to_vec(message).unwrap()
}

/// History as the broker reports it after `count` trips through the retry queue.
pub fn deaths(count: u32) -> DeathHistory {
    if count == 0 {
        return DeathHistory::default();
    }
    DeathHistory::from_records(vec![
        DeathRecord::new("retry_queue", "expired", count),
        DeathRecord::new("image_jobs", "rejected", count),
    ])
}

/// Blob store serving fixed originals and recording uploads.
#[derive(Default)]
pub struct FakeBlobs {
    originals: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    fetch_status: Mutex<Option<u16>>,
    push_status: Mutex<Option<u16>>,
}

impl FakeBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_original(self, filename: &str, bytes: Vec<u8>) -> Self {
        self.originals.lock().unwrap().insert(filename.to_string(), bytes);
        self
    }

    /// Every fetch answers with `status` instead of the file.
    pub fn fail_fetch(&self, status: u16) {
        *self.fetch_status.lock().unwrap() = Some(status);
    }

    pub fn fail_push(&self, status: u16) {
        *self.push_status.lock().unwrap() = Some(status);
    }

    pub fn heal(&self) {
        *self.fetch_status.lock().unwrap() = None;
        *self.push_status.lock().unwrap() = None;
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobTransfer for FakeBlobs {
    async fn fetch_original(&self, filename: &str) -> Result<Vec<u8>, TransferError> {
        let url = format!("http://blobs/images-uploaded/{}", filename);
        if let Some(status) = *self.fetch_status.lock().unwrap() {
            return Err(TransferError::Status { method: "GET", url, status });
        }
        self.originals
            .lock()
            .unwrap()
            .get(filename)
            .cloned()
            .ok_or(TransferError::Status { method: "GET", url, status: 404 })
    }

    async fn push_compressed(&self, filename: &str, bytes: Vec<u8>) -> Result<(), TransferError> {
        if let Some(status) = *self.push_status.lock().unwrap() {
            return Err(TransferError::Status {
                method: "POST",
                url: "http://blobs/compressed".to_string(),
                status,
            });
        }
        self.uploads.lock().unwrap().push((filename.to_string(), bytes));
        Ok(())
    }
}

/// Publisher that keeps what it was given, or refuses while offline.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<WorkMessage>>,
    offline: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<WorkMessage> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobPublisher for RecordingPublisher {
    async fn publish(&self, message: &WorkMessage) -> Result<(), PublishError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PublishError::Nacked);
        }
        self.published.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Memory store whose completion write can be made to fail. Every status
/// write is recorded as a `(from, to)` pair.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryJobStore,
    fail_completion: AtomicBool,
    transitions: Mutex<Vec<(JobStatus, JobStatus)>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_completion(&self, fail: bool) {
        self.fail_completion.store(fail, Ordering::SeqCst);
    }

    pub fn transitions(&self) -> Vec<(JobStatus, JobStatus)> {
        self.transitions.lock().unwrap().clone()
    }

    async fn record(&self, id: i64, next: JobStatus) {
        if let Ok(job) = self.inner.get_job(id).await {
            self.transitions.lock().unwrap().push((job.status, next));
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create_job(&self, filename: &str, original_size: i64) -> Result<i64, StoreError> {
        self.inner.create_job(filename, original_size).await
    }

    async fn get_job(&self, id: i64) -> Result<ImageJob, StoreError> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<ImageJob>, StoreError> {
        self.inner.list_jobs(limit).await
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<ImageJob>, StoreError> {
        self.inner.list_jobs_by_status(status, limit).await
    }

    async fn set_status(&self, id: i64, status: JobStatus) -> Result<(), StoreError> {
        self.record(id, status).await;
        self.inner.set_status(id, status).await
    }

    async fn mark_failed(&self, id: i64, message: &str) -> Result<(), StoreError> {
        self.record(id, JobStatus::Failed).await;
        self.inner.mark_failed(id, message).await
    }

    async fn mark_completed(
        &self,
        id: i64,
        compressed_size: i64,
        compressed_file_name: &str,
    ) -> Result<(), StoreError> {
        if self.fail_completion.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.record(id, JobStatus::Completed).await;
        self.inner
            .mark_completed(id, compressed_size, compressed_file_name)
            .await
    }
}
