//! Typed view of the broker's `x-death` header.
//!
//! RabbitMQ attaches one entry per (queue, reason) pair every time a message is
//! dead-lettered, newest first, each with a running `count`. The header is read
//! once when a delivery arrives; everything downstream uses [`DeathHistory`].

use chrono::{DateTime, Utc};
use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;

pub const X_DEATH_HEADER: &str = "x-death";

/// One dead-lettering event as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub queue: String,
    pub reason: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
    pub count: u32,
    pub time: Option<DateTime<Utc>>,
}

impl DeathRecord {
    pub fn new(queue: impl Into<String>, reason: impl Into<String>, count: u32) -> Self {
        Self {
            queue: queue.into(),
            reason: reason.into(),
            exchange: String::new(),
            routing_keys: Vec::new(),
            count,
            time: None,
        }
    }

    fn from_table(table: &FieldTable) -> Self {
        let fields = table.inner();
        let text = |key: &str| fields.get(key).and_then(as_text).unwrap_or_default();

        let routing_keys = match fields.get("routing-keys") {
            Some(AMQPValue::FieldArray(keys)) => keys.as_slice().iter().filter_map(as_text).collect(),
            _ => Vec::new(),
        };

        let time = match fields.get("time") {
            Some(AMQPValue::Timestamp(secs)) => i64::try_from(*secs)
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            _ => None,
        };

        Self {
            queue: text("queue"),
            reason: text("reason"),
            exchange: text("exchange"),
            routing_keys,
            count: fields.get("count").and_then(as_count).unwrap_or(0),
            time,
        }
    }
}

/// Ordered dead-lettering history of a delivery, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeathHistory {
    records: Vec<DeathRecord>,
}

impl DeathHistory {
    pub fn from_records(records: Vec<DeathRecord>) -> Self {
        Self { records }
    }

    pub fn from_properties(properties: &BasicProperties) -> Self {
        properties
            .headers()
            .as_ref()
            .map(Self::from_headers)
            .unwrap_or_default()
    }

    /// Entries that are not tables are skipped.
    pub fn from_headers(headers: &FieldTable) -> Self {
        let records = match headers.inner().get(X_DEATH_HEADER) {
            Some(AMQPValue::FieldArray(entries)) => entries
                .as_slice()
                .iter()
                .filter_map(|entry| match entry {
                    AMQPValue::FieldTable(table) => Some(DeathRecord::from_table(table)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        Self { records }
    }

    /// Prior attempts: the first record's count, zero when there is none.
    pub fn attempts(&self) -> u32 {
        self.records.first().map(|record| record.count).unwrap_or(0)
    }

    pub fn records(&self) -> &[DeathRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn as_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(s.to_string()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn as_count(value: &AMQPValue) -> Option<u32> {
    let count = match value {
        AMQPValue::LongLongInt(n) => *n,
        AMQPValue::LongInt(n) => i64::from(*n),
        AMQPValue::LongUInt(n) => i64::from(*n),
        AMQPValue::ShortInt(n) => i64::from(*n),
        AMQPValue::ShortUInt(n) => i64::from(*n),
        AMQPValue::ShortShortInt(n) => i64::from(*n),
        AMQPValue::ShortShortUInt(n) => i64::from(*n),
        _ => return None,
    };
    u32::try_from(count).ok()
}
