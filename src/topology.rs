//! Broker topology for delayed retries and dead-lettering.
//!
//! ```text
//! image_jobs --reject--> retry_exchange --retry--> retry_queue (ttl 5s)
//!     ^                                                 |
//!     +------------- default exchange <---expired-------+
//!
//! worker --terminal--> dead_letter_exchange --failed_jobs--> failed_jobs
//! ```
//!
//! The delay comes from TTL expiry on `retry_queue`, never from a timer in the worker.

use crate::error::WorkerError;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};
use std::time::Duration;

pub const MAIN_QUEUE: &str = "image_jobs";
pub const RETRY_EXCHANGE: &str = "retry_exchange";
pub const RETRY_ROUTING_KEY: &str = "retry";
pub const RETRY_QUEUE: &str = "retry_queue";
pub const DEAD_LETTER_EXCHANGE: &str = "dead_letter_exchange";
pub const FAILED_QUEUE: &str = "failed_jobs";
pub const FAILED_ROUTING_KEY: &str = "failed_jobs";
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Names and arguments of every exchange and queue the pipeline relies on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub main_queue: String,
    pub retry_exchange: String,
    pub retry_routing_key: String,
    pub retry_queue: String,
    pub retry_delay: Duration,
    pub dead_letter_exchange: String,
    pub failed_queue: String,
    pub failed_routing_key: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            main_queue: MAIN_QUEUE.to_string(),
            retry_exchange: RETRY_EXCHANGE.to_string(),
            retry_routing_key: RETRY_ROUTING_KEY.to_string(),
            retry_queue: RETRY_QUEUE.to_string(),
            retry_delay: RETRY_DELAY,
            dead_letter_exchange: DEAD_LETTER_EXCHANGE.to_string(),
            failed_queue: FAILED_QUEUE.to_string(),
            failed_routing_key: FAILED_ROUTING_KEY.to_string(),
        }
    }
}

impl Topology {
    /// Rejected work is dead-lettered into the retry hop.
    pub fn main_queue_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.retry_exchange.as_str().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(self.retry_routing_key.as_str().into()),
        );
        args
    }

    /// Expired retries go back to the main queue through the default exchange.
    pub fn retry_queue_arguments(&self) -> FieldTable {
        let ttl_ms = i32::try_from(self.retry_delay.as_millis()).unwrap_or(i32::MAX);
        let mut args = FieldTable::default();
        args.insert("x-message-ttl".into(), AMQPValue::LongInt(ttl_ms));
        args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(self.main_queue.as_str().into()),
        );
        args
    }

    /// Declares every exchange, queue and binding. Safe to run on each startup;
    /// the broker refuses a redeclaration with different arguments, which is
    /// returned as [`WorkerError::Topology`].
    pub async fn declare(&self, channel: &Channel) -> Result<(), WorkerError> {
        self.declare_exchange(channel, &self.dead_letter_exchange).await?;
        self.declare_exchange(channel, &self.retry_exchange).await?;

        self.declare_queue(channel, &self.retry_queue, self.retry_queue_arguments())
            .await?;
        self.bind(channel, &self.retry_queue, &self.retry_exchange, &self.retry_routing_key)
            .await?;

        self.declare_queue(channel, &self.failed_queue, FieldTable::default())
            .await?;
        self.bind(
            channel,
            &self.failed_queue,
            &self.dead_letter_exchange,
            &self.failed_routing_key,
        )
        .await?;

        self.declare_queue(channel, &self.main_queue, self.main_queue_arguments())
            .await?;

        log::info!(
            "Topology ready: '{}' retries via '{}' ({:?} delay), terminal failures in '{}'",
            self.main_queue,
            self.retry_queue,
            self.retry_delay,
            self.failed_queue
        );
        Ok(())
    }

    async fn declare_exchange(&self, channel: &Channel, name: &str) -> Result<(), WorkerError> {
        channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|source| Self::fatal(format!("exchange '{}'", name), source))
    }

    async fn declare_queue(
        &self,
        channel: &Channel,
        name: &str,
        arguments: FieldTable,
    ) -> Result<(), WorkerError> {
        channel
            .queue_declare(
                name,
                QueueDeclareOptions { durable: true, ..Default::default() },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|source| Self::fatal(format!("queue '{}'", name), source))
    }

    async fn bind(
        &self,
        channel: &Channel,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), WorkerError> {
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| {
                Self::fatal(format!("binding '{}' -> '{}' ({})", exchange, queue, routing_key), source)
            })
    }

    fn fatal(entity: String, source: lapin::Error) -> WorkerError {
        log::error!(
            "Failed to declare {}. If it already exists with different arguments, delete it or align the configuration. Error: {}",
            entity,
            source
        );
        WorkerError::Topology { entity, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg<'a>(table: &'a FieldTable, key: &str) -> &'a AMQPValue {
        table.inner().get(key).unwrap()
    }

    #[test]
    fn test_default_names() {
        let topology = Topology::default();
        assert_eq!(topology.main_queue, "image_jobs");
        assert_eq!(topology.retry_exchange, "retry_exchange");
        assert_eq!(topology.retry_queue, "retry_queue");
        assert_eq!(topology.dead_letter_exchange, "dead_letter_exchange");
        assert_eq!(topology.failed_queue, "failed_jobs");
        assert_eq!(topology.failed_routing_key, "failed_jobs");
    }

    #[test]
    fn test_main_queue_dead_letters_to_retry_exchange() {
        let args = Topology::default().main_queue_arguments();
        assert_eq!(
            arg(&args, "x-dead-letter-exchange"),
            &AMQPValue::LongString("retry_exchange".into())
        );
        assert_eq!(
            arg(&args, "x-dead-letter-routing-key"),
            &AMQPValue::LongString("retry".into())
        );
        assert!(args.inner().get("x-message-ttl").is_none());
    }

    #[test]
    fn test_retry_queue_expires_back_to_main_queue() {
        let args = Topology::default().retry_queue_arguments();
        assert_eq!(arg(&args, "x-message-ttl"), &AMQPValue::LongInt(5000));
        assert_eq!(
            arg(&args, "x-dead-letter-exchange"),
            &AMQPValue::LongString("".into())
        );
        assert_eq!(
            arg(&args, "x-dead-letter-routing-key"),
            &AMQPValue::LongString("image_jobs".into())
        );
    }

    #[test]
    fn test_custom_delay_is_reflected_in_ttl() {
        let topology = Topology {
            retry_delay: Duration::from_millis(250),
            ..Default::default()
        };
        assert_eq!(
            arg(&topology.retry_queue_arguments(), "x-message-ttl"),
            &AMQPValue::LongInt(250)
        );
    }
}
