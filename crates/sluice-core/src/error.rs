//! Error taxonomy for the event-sourcing runtime.

use crate::record::TopicPartition;

/// Errors raised by the runtime and surfaced to error handlers.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// An incoming record could not be deserialized.
    #[error("deserialization failed for {topic_partition} at offset {offset}: {reason}")]
    Deserialization {
        /// Partition the poison record was fetched from.
        topic_partition: TopicPartition,
        /// Offset of the poison record.
        offset: i64,
        /// Decoder-supplied failure description.
        reason: String,
    },

    /// A producer transaction failed.
    #[error("transaction error: {reason}")]
    Txn {
        /// Broker- or client-supplied failure description.
        reason: String,
        /// Whether retrying the transaction may succeed.
        retriable: bool,
    },

    /// A user handler returned a fatal execution state.
    #[error("event handler reported a fatal state for {topic_partition}")]
    HandlerFatal {
        /// Partition whose handler failed.
        topic_partition: TopicPartition,
    },

    /// Invalid runtime configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Kafka client or runtime-plumbing failure.
    #[error("client error: {0}")]
    Client(String),
}

impl SourceError {
    /// Returns `true` if retrying the failed operation may succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Txn { retriable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_txn() {
        let err = SourceError::Txn {
            reason: "coordinator moved".into(),
            retriable: true,
        };
        assert!(err.is_retriable());
    }

    #[test]
    fn test_non_retriable_variants() {
        let tp = TopicPartition::new("events", 0);
        assert!(!SourceError::HandlerFatal {
            topic_partition: tp.clone()
        }
        .is_retriable());
        assert!(!SourceError::Deserialization {
            topic_partition: tp,
            offset: 3,
            reason: "truncated".into(),
        }
        .is_retriable());
        assert!(!SourceError::Config("bad".into()).is_retriable());
    }

    #[test]
    fn test_display_includes_partition() {
        let err = SourceError::Deserialization {
            topic_partition: TopicPartition::new("events", 4),
            offset: 17,
            reason: "not utf8".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("events-4"));
        assert!(msg.contains("17"));
    }
}
