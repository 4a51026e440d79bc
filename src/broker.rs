//! Owned broker connection and the publishing side of the pipeline.

use crate::error::{PublishError, WorkerError};
use crate::job::WorkMessage;
use crate::topology::Topology;
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::future::Future;

/// AMQP delivery mode 2: written to disk by the broker.
pub const PERSISTENT: u8 = 2;

const CLOSE_OK: u16 = 200;

/// Connection and channel opened once at startup and closed once at shutdown.
///
/// The dispatcher and the worker borrow it at construction instead of reaching
/// for a process-wide handle.
pub struct BrokerConnection {
    connection: Connection,
    channel: Channel,
    topology: Topology,
}

impl BrokerConnection {
    /// Connects, enables publisher confirms and declares `topology`.
    ///
    /// The connection is closed again if any step after connecting fails.
    pub async fn open(url: &str, topology: Topology) -> Result<Self, WorkerError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let setup = Self::prepare(&connection, &topology).await;
        let channel = close_on_error(setup, || connection.close(CLOSE_OK, "setup failed")).await?;

        log::info!("Connected to RabbitMQ, channel {} in confirm mode", channel.id());
        Ok(Self {
            connection,
            channel,
            topology,
        })
    }

    async fn prepare(connection: &Connection, topology: &Topology) -> Result<Channel, WorkerError> {
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        topology.declare(&channel).await?;
        Ok(channel)
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Publisher that sends work to the main queue.
    pub fn publisher(&self) -> AmqpPublisher {
        AmqpPublisher::new(self.channel.clone(), self.topology.main_queue.clone())
    }

    /// Closes the channel, then the connection. Consumers must be stopped first.
    pub async fn close(self) -> Result<(), WorkerError> {
        if self.channel.status().connected() {
            self.channel.close(CLOSE_OK, "shutdown").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(CLOSE_OK, "shutdown").await?;
        }
        log::info!("RabbitMQ connection closed");
        Ok(())
    }
}

/// Runs `close` when `setup` failed, then hands the setup result back.
async fn close_on_error<T, C, F>(setup: Result<T, WorkerError>, close: C) -> Result<T, WorkerError>
where
    C: FnOnce() -> F,
    F: Future<Output = Result<(), lapin::Error>>,
{
    if setup.is_err() {
        if let Err(e) = close().await {
            log::warn!("Failed to close RabbitMQ connection after setup error: {}", e);
        }
    }
    setup
}

/// Sends [`WorkMessage`]s to the main queue.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Resolves once the broker has confirmed the message.
    async fn publish(&self, message: &WorkMessage) -> Result<(), PublishError>;
}

#[derive(Clone)]
pub struct AmqpPublisher {
    channel: Channel,
    queue: String,
}

impl AmqpPublisher {
    pub fn new(channel: Channel, queue: String) -> Self {
        Self { channel, queue }
    }
}

#[async_trait]
impl JobPublisher for AmqpPublisher {
    async fn publish(&self, message: &WorkMessage) -> Result<(), PublishError> {
        let body = serde_json::to_vec(message)?;
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        // Default exchange, addressed by queue name.
        publish_confirmed(&self.channel, "", &self.queue, &body, properties).await?;

        log::info!("Published job ID {} to queue '{}'", message.id, self.queue);
        Ok(())
    }
}

/// Publishes and waits for the broker's confirm.
pub(crate) async fn publish_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    properties: BasicProperties,
) -> Result<(), PublishError> {
    let confirmation = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            body,
            properties,
        )
        .await?
        .await?;

    if confirmation.is_nack() {
        return Err(PublishError::Nacked);
    }
    Ok(())
}
