//! Consumer group rebalance tracking.
//!
//! [`SluiceConsumerContext`] is an rdkafka `ConsumerContext` that converts
//! rebalance callbacks into [`RebalanceEvent`]s on an unbounded channel.
//! Rebalance callbacks run on rdkafka's background thread, so the context
//! only forwards; the runtime task that owns the receiving end assigns and
//! revokes partition workers (waiting out each revocation drain) without
//! blocking the client.

use std::sync::atomic::{AtomicU64, Ordering};

use rdkafka::consumer::ConsumerContext;
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{info, warn};

use sluice_core::TopicPartition;

/// A consumer group membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    /// Partitions newly assigned to this consumer.
    Assigned(Vec<TopicPartition>),
    /// Partitions about to be revoked from this consumer.
    Revoked(Vec<TopicPartition>),
}

/// rdkafka consumer context forwarding rebalances to the runtime.
pub struct SluiceConsumerContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
    rebalance_count: AtomicU64,
}

impl SluiceConsumerContext {
    /// Creates a context sending membership changes to `events`.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<RebalanceEvent>) -> Self {
        Self {
            events,
            rebalance_count: AtomicU64::new(0),
        }
    }

    /// Total rebalance events observed.
    #[must_use]
    pub fn rebalance_count(&self) -> u64 {
        self.rebalance_count.load(Ordering::Relaxed)
    }

    fn publish(&self, event: RebalanceEvent) {
        self.rebalance_count.fetch_add(1, Ordering::Relaxed);
        if self.events.send(event).is_err() {
            warn!("rebalance listener dropped; ignoring membership change");
        }
    }
}

/// Extracts the `(topic, partition)` pairs from a partition list.
#[must_use]
pub(crate) fn partitions_from_list(list: &TopicPartitionList) -> Vec<TopicPartition> {
    list.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

impl ClientContext for SluiceConsumerContext {}

impl ConsumerContext for SluiceConsumerContext {
    fn pre_rebalance(&self, rebalance: &rdkafka::consumer::Rebalance<'_>) {
        use rdkafka::consumer::Rebalance;

        match rebalance {
            Rebalance::Assign(list) => {
                let partitions = partitions_from_list(list);
                info!(
                    partitions_assigned = partitions.len(),
                    "kafka rebalance: new partitions assigned"
                );
                self.publish(RebalanceEvent::Assigned(partitions));
            }
            Rebalance::Revoke(list) => {
                let partitions = partitions_from_list(list);
                info!(
                    partitions_revoked = partitions.len(),
                    "kafka rebalance: partitions being revoked"
                );
                self.publish(RebalanceEvent::Revoked(partitions));
            }
            Rebalance::Error(msg) => {
                warn!(error = %msg, "kafka rebalance error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_from_list() {
        let mut list = TopicPartitionList::new();
        list.add_partition("events", 0);
        list.add_partition("events", 2);

        let partitions = partitions_from_list(&list);
        assert_eq!(
            partitions,
            vec![
                TopicPartition::new("events", 0),
                TopicPartition::new("events", 2),
            ]
        );
    }

    #[test]
    fn test_publish_counts_and_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = SluiceConsumerContext::new(tx);
        assert_eq!(context.rebalance_count(), 0);

        context.publish(RebalanceEvent::Assigned(vec![TopicPartition::new(
            "events", 1,
        )]));
        assert_eq!(context.rebalance_count(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            RebalanceEvent::Assigned(vec![TopicPartition::new("events", 1)])
        );
    }

    #[test]
    fn test_publish_with_dropped_listener() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let context = SluiceConsumerContext::new(tx);
        // Only logs; the count still moves.
        context.publish(RebalanceEvent::Revoked(Vec::new()));
        assert_eq!(context.rebalance_count(), 1);
    }
}
