//! # Image Compress Worker
//! Moves uploaded images from `pending` to `completed` through a durable RabbitMQ
//! queue, with broker-native delayed retries and a dead-letter queue.

pub mod broker;
pub mod compress;
pub mod config;
pub mod death;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod processor;
pub mod store;
pub mod topology;
pub mod transfer;
pub mod worker;

// Re-export key components for easy access
pub use broker::{AmqpPublisher, BrokerConnection, JobPublisher};
pub use compress::{Compressed, Compressor};
pub use config::AppConfig;
pub use death::{DeathHistory, DeathRecord};
pub use dispatcher::Dispatcher;
pub use error::{
    CompressionError, DispatchError, PublishError, StoreError, TransferError, WorkerError,
};
pub use job::{ImageJob, JobStatus, WorkMessage};
pub use processor::{Disposition, JobProcessor, Stage};
pub use store::{JobStore, MemoryJobStore, PgJobStore};
pub use topology::Topology;
pub use transfer::{BlobTransfer, HttpBlobTransfer};
pub use worker::{ImageWorker, Settlement};
