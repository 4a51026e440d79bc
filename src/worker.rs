//! The consuming side: pulls deliveries from the main queue one at a time and
//! settles each with exactly one broker action.

use crate::broker::{publish_confirmed, BrokerConnection, PERSISTENT};
use crate::config::AppConfig;
use crate::death::DeathHistory;
use crate::error::{PublishError, WorkerError};
use crate::processor::{Disposition, JobProcessor};
use crate::topology::Topology;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
        BasicRejectOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};
use std::future::Future;

/// Header naming why a message was moved to the failed queue.
pub const FAILURE_REASON_HEADER: &str = "x-failure-reason";

/// The broker action that settles one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// `requeue: false` hands the message to the main queue's dead-letter
    /// exchange, which is the delayed retry hop.
    Reject { requeue: bool },
    /// Republish to the failed queue, then ack the original.
    DeadLetterThenAck,
}

impl Settlement {
    pub fn for_disposition(disposition: &Disposition) -> Self {
        match disposition {
            Disposition::Ack => Settlement::Ack,
            Disposition::Retry { .. } => Settlement::Reject { requeue: false },
            Disposition::DeadLetter { .. } => Settlement::DeadLetterThenAck,
        }
    }
}

/// Competing consumer on the main queue. Run as many as needed against the
/// same queue; the broker hands each delivery to exactly one of them.
pub struct ImageWorker {
    channel: Channel,
    topology: Topology,
    processor: JobProcessor,
    consumer_tag: String,
    prefetch_count: u16,
}

impl ImageWorker {
    pub fn new(broker: &BrokerConnection, processor: JobProcessor, config: &AppConfig) -> Self {
        Self {
            channel: broker.channel().clone(),
            topology: broker.topology().clone(),
            processor,
            consumer_tag: config.consumer_tag.clone(),
            prefetch_count: config.prefetch_count,
        }
    }

    /// Consumes until `shutdown` resolves or the broker ends the subscription.
    ///
    /// On shutdown the consumer is cancelled first and the delivery being worked
    /// on, if any, is settled before this returns, so the connection can be
    /// closed afterwards without dropping work mid-step.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()>,
    {
        self.channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await?;
        log::info!("QoS prefetch count set to {}", self.prefetch_count);

        let mut consumer = self
            .channel
            .basic_consume(
                &self.topology.main_queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let tag = consumer.tag().as_str().to_string();
        log::info!(
            "Consumer started with tag '{}' on '{}'. Waiting for messages...",
            tag,
            self.topology.main_queue
        );

        tokio::pin!(shutdown);
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, cancelling consumer '{}'", tag);
                    self.channel
                        .basic_cancel(&tag, BasicCancelOptions::default())
                        .await?;
                    break;
                }
                next = consumer.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.handle(delivery).await,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    log::warn!("Consumer '{}' was cancelled by the broker", tag);
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle(&self, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let deaths = DeathHistory::from_properties(&delivery.properties);

        let disposition = self.processor.process(&delivery.data, &deaths).await;
        if let Err(e) = self.settle(&delivery, &disposition).await {
            // The broker redelivers unsettled messages once this channel goes away.
            log::error!(
                "Failed to settle delivery {} ({:?}): {}",
                delivery_tag,
                disposition,
                e
            );
        }
    }

    async fn settle(&self, delivery: &Delivery, disposition: &Disposition) -> Result<(), WorkerError> {
        let delivery_tag = delivery.delivery_tag;
        match Settlement::for_disposition(disposition) {
            Settlement::Ack => {
                delivery.ack(BasicAckOptions::default()).await?;
                log::info!("Message acked. Tag: {}", delivery_tag);
            }
            Settlement::Reject { requeue } => {
                delivery.reject(BasicRejectOptions { requeue }).await?;
                log::info!(
                    "Message rejected for delayed retry ({:?}). Tag: {}",
                    disposition,
                    delivery_tag
                );
            }
            Settlement::DeadLetterThenAck => {
                let reason = disposition.reason().unwrap_or_default();
                match self.dead_letter(delivery, reason).await {
                    Ok(()) => {
                        delivery.ack(BasicAckOptions::default()).await?;
                        log::warn!(
                            "Message moved to '{}' ({}). Tag: {}",
                            self.topology.failed_queue,
                            reason,
                            delivery_tag
                        );
                    }
                    Err(e) => {
                        // Comes back through the retry queue and is evaluated again.
                        log::error!(
                            "Failed to move message to '{}', rejecting for retry. Tag: {}, Error: {}",
                            self.topology.failed_queue,
                            delivery_tag,
                            e
                        );
                        delivery
                            .reject(BasicRejectOptions { requeue: false })
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// The main queue dead-letters into the retry hop, so terminal failures are
    /// republished to the dead-letter exchange instead of rejected.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), PublishError> {
        let properties = dead_letter_properties(&delivery.properties, reason);
        publish_confirmed(
            &self.channel,
            &self.topology.dead_letter_exchange,
            &self.topology.failed_routing_key,
            &delivery.data,
            properties,
        )
        .await
    }
}

/// Original headers and content type, persistent, plus the failure reason.
fn dead_letter_properties(original: &BasicProperties, reason: &str) -> BasicProperties {
    let mut headers = original.headers().clone().unwrap_or_default();
    headers.insert(
        FAILURE_REASON_HEADER.into(),
        AMQPValue::LongString(reason.into()),
    );

    let mut properties = BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_headers(headers);
    if let Some(content_type) = original.content_type() {
        properties = properties.with_content_type(content_type.clone());
    }
    properties
}
