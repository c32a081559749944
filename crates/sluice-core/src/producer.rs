//! The transactional producer pool contract.
//!
//! The pool itself lives outside this crate: it batches event contexts into
//! Kafka transactions, writes their state mutations and output records, and
//! commits offsets atomically. The worker only depends on the protocol
//! below.
//!
//! ## Reservation protocol
//!
//! For every context it creates, a worker hands the pool one
//! [`SlotReservation`]. The pool must resolve it exactly once: with
//! [`SlotReservation::assign`] when a producer takes responsibility for the
//! context, or [`SlotReservation::abandon`] when the pool is shutting down
//! or the partition was revoked. Dropping a reservation unresolved counts
//! as abandonment. Per partition, reservations are handed over in strict
//! offset order and the pool must commit in that admission order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::SourceError;
use crate::record::{Record, TopicPartition};

/// A shared transactional producer pool.
#[async_trait]
pub trait ProducerPool: Send + Sync + 'static {
    /// The pool's admission ceiling. Each worker bounds its in-flight
    /// contexts to this many.
    fn max_pending_items(&self) -> usize;

    /// Enqueues a context for a future transactional commit. May suspend
    /// while the pool's admission queue is full.
    async fn add_event_context(&self, reservation: SlotReservation);
}

/// One producer within the pool, scoped to an open transaction.
pub trait ProducerNode: Send + Sync {
    /// Emits an output record into the node's current transaction.
    fn produce(&self, record: Record) -> Result<(), SourceError>;

    /// Marks the context identified by `topic_partition`/`offset` as fully
    /// processed, making it eligible for the next commit.
    fn finish(&self, topic_partition: &TopicPartition, offset: Option<i64>);
}

/// A cloneable handle to the [`ProducerNode`] assigned to one context.
#[derive(Clone)]
pub struct ProducerSlot {
    node: Arc<dyn ProducerNode>,
}

impl ProducerSlot {
    /// Wraps a producer node.
    #[must_use]
    pub fn new(node: Arc<dyn ProducerNode>) -> Self {
        Self { node }
    }

    /// Emits an output record into the open transaction.
    pub fn produce(&self, record: Record) -> Result<(), SourceError> {
        self.node.produce(record)
    }

    /// Signals that the owning context finished processing.
    pub fn finish(&self, topic_partition: &TopicPartition, offset: Option<i64>) {
        self.node.finish(topic_partition, offset);
    }
}

impl std::fmt::Debug for ProducerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerSlot").finish_non_exhaustive()
    }
}

/// A pending producer assignment for one event context.
#[derive(Debug)]
pub struct SlotReservation {
    topic_partition: TopicPartition,
    offset: Option<i64>,
    slot_tx: oneshot::Sender<Option<ProducerSlot>>,
}

impl SlotReservation {
    pub(crate) fn new(
        topic_partition: TopicPartition,
        offset: Option<i64>,
        slot_tx: oneshot::Sender<Option<ProducerSlot>>,
    ) -> Self {
        Self {
            topic_partition,
            offset,
            slot_tx,
        }
    }

    /// The partition of the reserving context.
    #[must_use]
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// The reserving record's offset, or `None` for an interjection.
    #[must_use]
    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    /// Delivers the assigned producer slot to the waiting worker.
    pub fn assign(self, slot: ProducerSlot) {
        let _ = self.slot_tx.send(Some(slot));
    }

    /// Tells the waiting worker that no producer will take this context.
    pub fn abandon(self) {
        let _ = self.slot_tx.send(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct TestNode {
        finished: Mutex<Vec<Option<i64>>>,
    }

    impl ProducerNode for TestNode {
        fn produce(&self, _record: Record) -> Result<(), SourceError> {
            Ok(())
        }

        fn finish(&self, _topic_partition: &TopicPartition, offset: Option<i64>) {
            self.finished.lock().push(offset);
        }
    }

    fn reservation() -> (SlotReservation, oneshot::Receiver<Option<ProducerSlot>>) {
        let (tx, rx) = oneshot::channel();
        (
            SlotReservation::new(TopicPartition::new("events", 0), Some(7), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_assign_delivers_slot() {
        let (reservation, rx) = reservation();
        assert_eq!(reservation.offset(), Some(7));

        let node = Arc::new(TestNode {
            finished: Mutex::new(Vec::new()),
        });
        reservation.assign(ProducerSlot::new(Arc::clone(&node) as Arc<dyn ProducerNode>));

        let slot = rx.await.unwrap().unwrap();
        slot.finish(&TopicPartition::new("events", 0), Some(7));
        assert_eq!(node.finished.lock().as_slice(), &[Some(7)]);
    }

    #[tokio::test]
    async fn test_abandon_delivers_none() {
        let (reservation, rx) = reservation();
        reservation.abandon();
        assert!(rx.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_reservation_closes_channel() {
        let (reservation, rx) = reservation();
        drop(reservation);
        assert!(rx.await.is_err());
    }
}
