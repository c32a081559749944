//! Record and topic-partition value types.
//!
//! [`Record`] is the owned unit of data flowing through a partition worker.
//! It is detached from any Kafka client lifetime: keys and values are
//! reference-counted [`Bytes`], so records can cross task boundaries and be
//! re-emitted into producer transactions without copying payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A `(topic, partition)` pair identifying one Kafka partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name.
    pub topic: String,
    /// Partition id within the topic.
    pub partition: i32,
}

impl TopicPartition {
    /// Creates a new topic-partition identifier.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A single record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Header key.
    pub key: String,
    /// Header value.
    pub value: Bytes,
}

/// An owned Kafka record.
///
/// Input records arrive with the offset assigned by the broker; output
/// records built by handlers leave `offset` at `-1` (unassigned).
#[derive(Debug, Clone)]
pub struct Record {
    topic: String,
    partition: i32,
    offset: i64,
    timestamp_ms: Option<i64>,
    key: Option<Bytes>,
    value: Option<Bytes>,
    headers: Vec<RecordHeader>,
}

impl Record {
    /// Creates a new output record for the given topic with no partition
    /// preference (`partition = -1`, left to the producer's partitioner).
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: -1,
            offset: -1,
            timestamp_ms: None,
            key: None,
            value: None,
            headers: Vec::new(),
        }
    }

    /// Creates an input record as fetched from a broker.
    #[must_use]
    pub fn fetched(
        topic_partition: &TopicPartition,
        offset: i64,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Self {
        Self {
            topic: topic_partition.topic.clone(),
            partition: topic_partition.partition,
            offset,
            timestamp_ms: None,
            key,
            value,
            headers: Vec::new(),
        }
    }

    /// Sets the record key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the record value.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Pins the record to an explicit partition.
    #[must_use]
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    /// Sets the record timestamp (milliseconds since the epoch).
    #[must_use]
    pub fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(RecordHeader {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Topic this record belongs (or will be produced) to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition id, or `-1` when unassigned.
    #[must_use]
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Broker-assigned offset, or `-1` for output records.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Record timestamp in milliseconds since the epoch, if known.
    #[must_use]
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.timestamp_ms
    }

    /// Record key.
    #[must_use]
    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    /// Record value; `None` is a tombstone on compacted topics.
    #[must_use]
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// Record headers in append order.
    #[must_use]
    pub fn headers(&self) -> &[RecordHeader] {
        &self.headers
    }

    /// The topic-partition this record was fetched from.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("events", 3);
        assert_eq!(tp.to_string(), "events-3");
    }

    #[test]
    fn test_topic_partition_equality() {
        let a = TopicPartition::new("events", 0);
        let b = TopicPartition::new("events", 0);
        let c = TopicPartition::new("events", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_output_record_defaults() {
        let record = Record::new("out-topic").with_key("k").with_value("v");
        assert_eq!(record.topic(), "out-topic");
        assert_eq!(record.partition(), -1);
        assert_eq!(record.offset(), -1);
        assert_eq!(record.key().unwrap().as_ref(), b"k");
        assert_eq!(record.value().unwrap().as_ref(), b"v");
        assert!(record.headers().is_empty());
    }

    #[test]
    fn test_fetched_record() {
        let tp = TopicPartition::new("events", 2);
        let record = Record::fetched(&tp, 42, None, Some(Bytes::from_static(b"payload")));
        assert_eq!(record.offset(), 42);
        assert_eq!(record.topic_partition(), tp);
        assert!(record.key().is_none());
    }

    #[test]
    fn test_builder_chain() {
        let record = Record::new("out")
            .with_partition(7)
            .with_timestamp_ms(1_700_000_000_000)
            .with_header("source", "sluice");
        assert_eq!(record.partition(), 7);
        assert_eq!(record.timestamp_ms(), Some(1_700_000_000_000));
        assert_eq!(record.headers().len(), 1);
        assert_eq!(record.headers()[0].key, "source");
    }

    #[test]
    fn test_tombstone_value() {
        let tp = TopicPartition::new("changelog", 0);
        let record = Record::fetched(&tp, 9, Some(Bytes::from_static(b"k")), None);
        assert!(record.value().is_none());
    }

    #[test]
    fn test_topic_partition_serde_roundtrip() {
        let tp = TopicPartition::new("events", 5);
        let json = serde_json::to_string(&tp).unwrap();
        let back: TopicPartition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tp);
    }
}
