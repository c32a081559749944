//! Per-unit-of-work processing handles.
//!
//! An [`EventContext`] wraps one input record (or one interjection firing)
//! for its trip through a partition worker: it carries the partition's
//! state-store handle, receives the producer slot assigned by the pool, and
//! latches completion exactly once. Contexts are cheap to clone; async
//! completions hold a clone until their finalizer runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::SourceError;
use crate::execution::{AsyncJob, ExecutionState};
use crate::interjection::Interjection;
use crate::producer::{ProducerSlot, SlotReservation};
use crate::record::{Record, TopicPartition};
use crate::state::{ChangeLogPartition, StateStore};

enum ContextInput<S: StateStore> {
    Record(Record),
    Interjection(Arc<Interjection<S>>),
}

struct ContextInner<S: StateStore> {
    token: CancellationToken,
    topic_partition: TopicPartition,
    input: ContextInput<S>,
    change_log: ChangeLogPartition<S>,
    async_tx: mpsc::Sender<AsyncJob<S>>,
    slot_rx: Mutex<Option<oneshot::Receiver<Option<ProducerSlot>>>>,
    producer: OnceLock<Option<ProducerSlot>>,
    completed: AtomicBool,
}

/// Handle to one in-flight record or interjection on a partition worker.
pub struct EventContext<S: StateStore> {
    inner: Arc<ContextInner<S>>,
}

impl<S: StateStore> Clone for EventContext<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: StateStore> EventContext<S> {
    pub(crate) fn for_record(
        token: CancellationToken,
        record: Record,
        change_log: ChangeLogPartition<S>,
        async_tx: mpsc::Sender<AsyncJob<S>>,
    ) -> (Self, SlotReservation) {
        let topic_partition = record.topic_partition();
        let offset = Some(record.offset());
        Self::new(
            token,
            topic_partition,
            ContextInput::Record(record),
            offset,
            change_log,
            async_tx,
        )
    }

    pub(crate) fn for_interjection(
        token: CancellationToken,
        interjection: Arc<Interjection<S>>,
        topic_partition: TopicPartition,
        change_log: ChangeLogPartition<S>,
        async_tx: mpsc::Sender<AsyncJob<S>>,
    ) -> (Self, SlotReservation) {
        Self::new(
            token,
            topic_partition,
            ContextInput::Interjection(interjection),
            None,
            change_log,
            async_tx,
        )
    }

    fn new(
        token: CancellationToken,
        topic_partition: TopicPartition,
        input: ContextInput<S>,
        offset: Option<i64>,
        change_log: ChangeLogPartition<S>,
        async_tx: mpsc::Sender<AsyncJob<S>>,
    ) -> (Self, SlotReservation) {
        let (slot_tx, slot_rx) = oneshot::channel();
        let reservation = SlotReservation::new(topic_partition.clone(), offset, slot_tx);
        let ctx = Self {
            inner: Arc::new(ContextInner {
                token,
                topic_partition,
                input,
                change_log,
                async_tx,
                slot_rx: Mutex::new(Some(slot_rx)),
                producer: OnceLock::new(),
                completed: AtomicBool::new(false),
            }),
        };
        (ctx, reservation)
    }

    /// The partition this context belongs to.
    #[must_use]
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.inner.topic_partition
    }

    /// The input record's offset, or `None` for an interjection.
    #[must_use]
    pub fn offset(&self) -> Option<i64> {
        match &self.inner.input {
            ContextInput::Record(record) => Some(record.offset()),
            ContextInput::Interjection(_) => None,
        }
    }

    /// The input record, or `None` for an interjection.
    #[must_use]
    pub fn input(&self) -> Option<&Record> {
        match &self.inner.input {
            ContextInput::Record(record) => Some(record),
            ContextInput::Interjection(_) => None,
        }
    }

    /// Returns `true` if this context wraps an interjection firing.
    #[must_use]
    pub fn is_interjection(&self) -> bool {
        matches!(self.inner.input, ContextInput::Interjection(_))
    }

    /// Cancelled when the owning partition worker is revoked. Long-running
    /// async work should watch this and bail.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// The partition's change-log handle.
    #[must_use]
    pub fn change_log(&self) -> &ChangeLogPartition<S> {
        &self.inner.change_log
    }

    /// Locks the partition's state store. The guard must not be held across
    /// an await point.
    #[must_use]
    pub fn store(&self) -> MutexGuard<'_, S> {
        self.inner.change_log.store()
    }

    /// Emits an output record into the transaction of the assigned producer.
    ///
    /// # Errors
    ///
    /// Fails if no producer has been assigned yet (before the handler runs)
    /// or the context was abandoned during revocation.
    pub fn forward(&self, record: Record) -> Result<(), SourceError> {
        match self.inner.producer.get() {
            Some(Some(slot)) => slot.produce(record),
            _ => Err(SourceError::Client(
                "no producer assigned to this event context".into(),
            )),
        }
    }

    /// Schedules `finalizer` to run on the owning worker's dispatch loop.
    ///
    /// Called by application code after its handler returned
    /// [`ExecutionState::Incomplete`]; a finalizer returning
    /// [`ExecutionState::Complete`] completes the context and frees its
    /// pending slot.
    pub async fn async_complete(
        &self,
        finalizer: impl FnOnce() -> ExecutionState + Send + 'static,
    ) {
        let job = AsyncJob::new(self.clone(), finalizer);
        if self.inner.async_tx.send(job).await.is_err() {
            warn!(
                topic_partition = %self.inner.topic_partition,
                "async completion dropped; partition worker already terminated"
            );
        }
    }

    /// The interjection behind this context, if any.
    pub(crate) fn interjection(&self) -> Option<&Arc<Interjection<S>>> {
        match &self.inner.input {
            ContextInput::Record(_) => None,
            ContextInput::Interjection(interjection) => Some(interjection),
        }
    }

    /// Takes the pending slot receiver. Returns `None` once the assignment
    /// has already been consumed.
    pub(crate) fn take_slot_receiver(&self) -> Option<oneshot::Receiver<Option<ProducerSlot>>> {
        self.inner.slot_rx.lock().take()
    }

    /// Records the pool's assignment (or abandonment) of this context.
    pub(crate) fn set_producer(&self, slot: Option<ProducerSlot>) {
        let _ = self.inner.producer.set(slot);
    }

    /// The assigned producer slot, if one was delivered.
    pub(crate) fn producer(&self) -> Option<ProducerSlot> {
        self.inner.producer.get().cloned().flatten()
    }

    /// Latches completion and notifies the assigned producer that this
    /// context is commit-eligible. Idempotent.
    pub(crate) fn complete(&self) {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(Some(slot)) = self.inner.producer.get() {
            slot.finish(&self.inner.topic_partition, self.offset());
        }
    }

    /// Returns `true` once `complete()` has run.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }
}

impl<S: StateStore> std::fmt::Debug for EventContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventContext")
            .field("topic_partition", &self.inner.topic_partition)
            .field("offset", &self.offset())
            .field("interjection", &self.is_interjection())
            .field("complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::ProducerNode;
    use crate::state::InMemoryStore;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    struct CountingNode {
        produced: Mutex<Vec<Record>>,
        finished: AtomicUsize,
    }

    impl CountingNode {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                produced: Mutex::new(Vec::new()),
                finished: AtomicUsize::new(0),
            })
        }
    }

    impl ProducerNode for CountingNode {
        fn produce(&self, record: Record) -> Result<(), SourceError> {
            self.produced.lock().push(record);
            Ok(())
        }

        fn finish(&self, _topic_partition: &TopicPartition, _offset: Option<i64>) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_context() -> (
        EventContext<InMemoryStore>,
        SlotReservation,
        mpsc::Receiver<AsyncJob<InMemoryStore>>,
    ) {
        let tp = TopicPartition::new("events", 0);
        let record = Record::fetched(&tp, 12, None, Some(Bytes::from_static(b"v")));
        let change_log =
            ChangeLogPartition::new(InMemoryStore::new(), TopicPartition::new("changelog", 0));
        let (async_tx, async_rx) = mpsc::channel(4);
        let (ctx, reservation) =
            EventContext::for_record(CancellationToken::new(), record, change_log, async_tx);
        (ctx, reservation, async_rx)
    }

    #[tokio::test]
    async fn test_record_context_accessors() {
        let (ctx, _reservation, _rx) = record_context();
        assert_eq!(ctx.offset(), Some(12));
        assert!(!ctx.is_interjection());
        assert_eq!(ctx.input().unwrap().offset(), 12);
        assert_eq!(ctx.topic_partition(), &TopicPartition::new("events", 0));
    }

    #[tokio::test]
    async fn test_store_access() {
        let (ctx, _reservation, _rx) = record_context();
        ctx.store().put(b"k", b"v").unwrap();
        assert_eq!(ctx.store().get(b"k").unwrap(), Bytes::from("v"));
    }

    #[tokio::test]
    async fn test_forward_without_producer_fails() {
        let (ctx, _reservation, _rx) = record_context();
        let err = ctx.forward(Record::new("out")).unwrap_err();
        assert!(matches!(err, SourceError::Client(_)));
    }

    #[tokio::test]
    async fn test_forward_after_assignment() {
        let (ctx, reservation, _rx) = record_context();
        let node = CountingNode::new();
        reservation.assign(ProducerSlot::new(Arc::clone(&node) as Arc<dyn ProducerNode>));

        let slot = ctx.take_slot_receiver().unwrap().await.unwrap();
        ctx.set_producer(slot);

        ctx.forward(Record::new("out").with_value("payload")).unwrap();
        assert_eq!(node.produced.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let (ctx, reservation, _rx) = record_context();
        let node = CountingNode::new();
        reservation.assign(ProducerSlot::new(Arc::clone(&node) as Arc<dyn ProducerNode>));
        let slot = ctx.take_slot_receiver().unwrap().await.unwrap();
        ctx.set_producer(slot);

        ctx.complete();
        ctx.complete();
        assert!(ctx.is_complete());
        assert_eq!(node.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_complete_without_producer_latches() {
        let (ctx, _reservation, _rx) = record_context();
        ctx.complete();
        assert!(ctx.is_complete());
    }

    #[tokio::test]
    async fn test_async_complete_delivers_job() {
        let (ctx, _reservation, mut rx) = record_context();
        ctx.async_complete(|| ExecutionState::Complete).await;

        let job = rx.recv().await.unwrap();
        let (finalized, state) = job.finalize();
        assert_eq!(state, ExecutionState::Complete);
        assert_eq!(finalized.offset(), Some(12));
    }

    #[tokio::test]
    async fn test_slot_receiver_taken_once() {
        let (ctx, _reservation, _rx) = record_context();
        assert!(ctx.take_slot_receiver().is_some());
        assert!(ctx.take_slot_receiver().is_none());
    }
}
