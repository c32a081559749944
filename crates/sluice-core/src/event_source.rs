//! Event source orchestration.
//!
//! An [`EventSource`] owns the per-partition workers for one consumer
//! group: it spawns a worker when the consumer is assigned a partition,
//! routes fetched record batches to the right worker, offers ad-hoc
//! interjections, and drains workers when partitions are revoked or the
//! source shuts down.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::event_context::EventContext;
use crate::execution::ExecutionState;
use crate::interjection::{Interjection, Interjector};
use crate::producer::ProducerPool;
use crate::record::{Record, TopicPartition};
use crate::run_status::RunStatus;
use crate::source::{EventSourceConfig, EventSourceState, Source};
use crate::state::{ChangeLog, StateStore};
use crate::worker::PartitionWorker;

/// Pause/resume control over the Kafka consumer owning this source's
/// partitions. Implementations must be callable from any task.
pub trait ConsumerClient: Send + Sync {
    /// Stops fetching `topic_partition` until resumed.
    fn pause_partition(&self, topic_partition: &TopicPartition);

    /// Resumes fetching a previously paused `topic_partition`.
    fn resume_partition(&self, topic_partition: &TopicPartition);
}

/// The user handler invoked for every input record.
pub type EventProcessor<S> =
    Arc<dyn Fn(&EventContext<S>, &Record) -> ExecutionState + Send + Sync>;

/// Resolves once a partition's state store has been hydrated from the
/// change-log topic. Supplied per assignment by whichever component drives
/// the replay.
pub type BootstrapWaiter = BoxFuture<'static, ()>;

pub(crate) struct InterjectionSpec<S: StateStore> {
    interval: Duration,
    interjector: Interjector<S>,
}

pub(crate) struct EventSourceInner<S: StateStore> {
    pub(crate) source: Arc<Source>,
    pub(crate) consumer: Arc<dyn ConsumerClient>,
    pub(crate) producer_pool: Arc<dyn ProducerPool>,
    pub(crate) change_log: ChangeLog<S>,
    pub(crate) processor: EventProcessor<S>,
    pub(crate) run_status: RunStatus,
    interjections: Mutex<Vec<InterjectionSpec<S>>>,
    workers: Mutex<FxHashMap<i32, PartitionWorker<S>>>,
}

impl<S: StateStore> EventSourceInner<S> {
    /// Materializes fresh interjection instances for a newly assigned
    /// partition; timers are per-worker.
    pub(crate) fn interjection_instances(&self) -> Vec<Arc<Interjection<S>>> {
        self.interjections
            .lock()
            .iter()
            .map(|spec| {
                Arc::new(Interjection::periodic(
                    spec.interval,
                    Arc::clone(&spec.interjector),
                ))
            })
            .collect()
    }
}

/// The runtime owning a consumer group's per-partition processing.
pub struct EventSource<S: StateStore> {
    inner: Arc<EventSourceInner<S>>,
}

impl<S: StateStore> Clone for EventSource<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: StateStore> EventSource<S> {
    /// Creates an event source from validated configuration and its
    /// external collaborators. `store_factory` builds the empty state store
    /// hydrated for each assigned partition.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] when the configuration is invalid.
    pub fn new(
        config: EventSourceConfig,
        consumer: Arc<dyn ConsumerClient>,
        producer_pool: Arc<dyn ProducerPool>,
        store_factory: impl Fn() -> S + Send + Sync + 'static,
        processor: impl Fn(&EventContext<S>, &Record) -> ExecutionState + Send + Sync + 'static,
    ) -> Result<Self, SourceError> {
        let source = Arc::new(Source::new(config)?);
        let change_log = ChangeLog::new(source.state_store_topic_name(), store_factory);
        Ok(Self {
            inner: Arc::new(EventSourceInner {
                source,
                consumer,
                producer_pool,
                change_log,
                processor: Arc::new(processor),
                run_status: RunStatus::new(),
                interjections: Mutex::new(Vec::new()),
                workers: Mutex::new(FxHashMap::default()),
            }),
        })
    }

    /// The source's validated configuration and health.
    #[must_use]
    pub fn source(&self) -> &Arc<Source> {
        &self.inner.source
    }

    /// Current health.
    #[must_use]
    pub fn state(&self) -> EventSourceState {
        self.inner.source.state()
    }

    /// The change log backing this source's partition state.
    #[must_use]
    pub fn change_log(&self) -> &ChangeLog<S> {
        &self.inner.change_log
    }

    /// Raises the terminal source failure.
    pub fn fail(&self, err: SourceError) {
        self.inner.source.fail(err);
    }

    /// Registers a periodic interjection applied to every partition
    /// assigned from now on.
    pub fn add_interjection(
        &self,
        interval: Duration,
        interjector: impl Fn(&EventContext<S>) -> ExecutionState + Send + Sync + 'static,
    ) {
        self.inner.interjections.lock().push(InterjectionSpec {
            interval,
            interjector: Arc::new(interjector),
        });
    }

    /// Spawns the worker for a newly assigned partition. `waiter` resolves
    /// once the partition's state store has been hydrated; fetching stays
    /// paused until then. Must run inside a tokio runtime.
    pub fn assign_partition(&self, partition: i32, waiter: BootstrapWaiter) {
        let mut workers = self.inner.workers.lock();
        if workers.contains_key(&partition) {
            warn!(partition, "partition already assigned; ignoring");
            return;
        }
        debug!(topic = self.inner.source.topic(), partition, "partition assigned");
        let change_log_partition = self.inner.change_log.partition(partition);
        let worker = PartitionWorker::new(
            Arc::clone(&self.inner),
            partition,
            change_log_partition,
            waiter,
        );
        workers.insert(partition, worker);
        drop(workers);
        self.inner.source.on_partition_assigned(partition);
    }

    /// Revokes a partition: halts its worker, waits for the drain to
    /// finish, and releases the partition's state.
    pub async fn revoke_partition(&self, partition: i32) {
        let Some(worker) = self.inner.workers.lock().remove(&partition) else {
            return;
        };
        self.inner.source.on_partition_will_revoke(partition);
        worker.revoke();
        worker.terminated().await;
        self.inner.change_log.evict(partition);
        self.inner.source.on_partition_revoked(partition);
        debug!(topic = self.inner.source.topic(), partition, "partition revoked");
    }

    /// Routes a fetched record batch to the owning worker. Records for
    /// unassigned partitions are dropped.
    pub async fn add_records(&self, partition: i32, records: Vec<Record>) {
        let worker = self.inner.workers.lock().get(&partition).cloned();
        match worker {
            Some(worker) => worker.add(records).await,
            None => debug!(partition, "dropping records for unassigned partition"),
        }
    }

    /// Returns `true` once `partition` is assigned and its state store is
    /// bootstrapped.
    #[must_use]
    pub fn can_interject(&self, partition: i32) -> bool {
        self.inner
            .workers
            .lock()
            .get(&partition)
            .is_some_and(PartitionWorker::can_interject)
    }

    /// Runs a one-shot interjection on `partition` and waits for it to
    /// resolve: processed, abandoned during revocation, or cancelled.
    ///
    /// # Errors
    ///
    /// Fails when the partition is not assigned or still bootstrapping.
    pub async fn interject(
        &self,
        partition: i32,
        interjector: impl Fn(&EventContext<S>) -> ExecutionState + Send + Sync + 'static,
    ) -> Result<(), SourceError> {
        let worker = self
            .inner
            .workers
            .lock()
            .get(&partition)
            .cloned()
            .ok_or_else(|| {
                SourceError::Client(format!("partition {partition} is not assigned"))
            })?;
        if !worker.can_interject() {
            return Err(SourceError::Client(format!(
                "partition {partition} is still bootstrapping its state store"
            )));
        }
        let (done_tx, done_rx) = oneshot::channel();
        let interjection = Arc::new(Interjection::one_shot(
            Arc::new(interjector),
            Box::new(move || {
                let _ = done_tx.send(());
            }),
        ));
        worker.offer_interjection(interjection).await;
        done_rx.await.map_err(|_| {
            SourceError::Client("interjection was dropped before it resolved".into())
        })
    }

    /// Partitions currently assigned, in no particular order.
    #[must_use]
    pub fn assigned_partitions(&self) -> Vec<i32> {
        self.inner.workers.lock().keys().copied().collect()
    }

    /// Shuts the source down: halts every worker and waits for each to
    /// drain, then releases all partition state.
    pub async fn close(&self) {
        info!(topic = self.inner.source.topic(), "shutting down event source");
        self.inner.run_status.halt();
        let workers: Vec<PartitionWorker<S>> =
            self.inner.workers.lock().drain().map(|(_, w)| w).collect();
        for worker in workers {
            let partition = worker.topic_partition().partition;
            worker.terminated().await;
            self.inner.change_log.evict(partition);
            self.inner.source.on_partition_revoked(partition);
        }
    }

    pub(crate) fn worker(&self, partition: i32) -> Option<PartitionWorker<S>> {
        self.inner.workers.lock().get(&partition).cloned()
    }
}

impl<S: StateStore> std::fmt::Debug for EventSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("topic", &self.inner.source.topic())
            .field("group_id", &self.inner.source.group_id())
            .field("state", &self.state())
            .field("assigned_partitions", &self.assigned_partitions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::{ProducerNode, ProducerSlot, SlotReservation};
    use crate::source::SourcePartitionEventHandler;
    use crate::state::InMemoryStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct NoopConsumer;

    impl ConsumerClient for NoopConsumer {
        fn pause_partition(&self, _topic_partition: &TopicPartition) {}
        fn resume_partition(&self, _topic_partition: &TopicPartition) {}
    }

    #[derive(Default)]
    struct NoopNode;

    impl ProducerNode for NoopNode {
        fn produce(&self, _record: Record) -> Result<(), SourceError> {
            Ok(())
        }
        fn finish(&self, _topic_partition: &TopicPartition, _offset: Option<i64>) {}
    }

    struct AssigningPool {
        node: Arc<NoopNode>,
    }

    impl AssigningPool {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                node: Arc::new(NoopNode),
            })
        }
    }

    #[async_trait]
    impl ProducerPool for AssigningPool {
        fn max_pending_items(&self) -> usize {
            8
        }

        async fn add_event_context(&self, reservation: SlotReservation) {
            reservation.assign(ProducerSlot::new(
                Arc::clone(&self.node) as Arc<dyn ProducerNode>
            ));
        }
    }

    fn test_source(
        config: EventSourceConfig,
    ) -> EventSource<InMemoryStore> {
        EventSource::new(
            config,
            Arc::new(NoopConsumer),
            AssigningPool::new(),
            InMemoryStore::new,
            |_: &EventContext<InMemoryStore>, _: &Record| ExecutionState::Complete,
        )
        .unwrap()
    }

    fn ready_waiter() -> BootstrapWaiter {
        Box::pin(async {})
    }

    async fn wait_ready(es: &EventSource<InMemoryStore>, partition: i32) {
        for _ in 0..600 {
            if es.can_interject(partition) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("partition {partition} never became ready");
    }

    fn counting_handler(counter: &Arc<AtomicUsize>) -> Option<SourcePartitionEventHandler> {
        let counter = Arc::clone(counter);
        Some(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test]
    async fn test_assign_and_revoke_lifecycle_callbacks() {
        let assigned = Arc::new(AtomicUsize::new(0));
        let activated = Arc::new(AtomicUsize::new(0));
        let will_revoke = Arc::new(AtomicUsize::new(0));
        let revoked = Arc::new(AtomicUsize::new(0));

        let mut config = EventSourceConfig::new("grp", "events");
        config.on_partition_assigned = counting_handler(&assigned);
        config.on_partition_activated = counting_handler(&activated);
        config.on_partition_will_revoke = counting_handler(&will_revoke);
        config.on_partition_revoked = counting_handler(&revoked);

        let es = test_source(config);
        es.assign_partition(0, ready_waiter());
        assert_eq!(assigned.load(Ordering::SeqCst), 1);
        wait_ready(&es, 0).await;
        assert_eq!(activated.load(Ordering::SeqCst), 1);

        es.revoke_partition(0).await;
        assert_eq!(will_revoke.load(Ordering::SeqCst), 1);
        assert_eq!(revoked.load(Ordering::SeqCst), 1);
        assert!(es.assigned_partitions().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_assignment_is_ignored() {
        let es = test_source(EventSourceConfig::new("grp", "events"));
        es.assign_partition(0, ready_waiter());
        es.assign_partition(0, ready_waiter());
        assert_eq!(es.assigned_partitions(), vec![0]);
        es.close().await;
    }

    #[tokio::test]
    async fn test_add_records_for_unassigned_partition_is_dropped() {
        let es = test_source(EventSourceConfig::new("grp", "events"));
        let record = Record::fetched(&TopicPartition::new("events", 9), 0, None, None);
        es.add_records(9, vec![record]).await;
    }

    #[tokio::test]
    async fn test_interject_mutates_partition_state() {
        let es = test_source(EventSourceConfig::new("grp", "events"));
        es.assign_partition(0, ready_waiter());
        wait_ready(&es, 0).await;

        es.interject(0, |ec| {
            ec.store().put(b"visited", b"yes").unwrap();
            ExecutionState::Complete
        })
        .await
        .unwrap();

        let state = es.change_log().partition(0);
        assert_eq!(state.store().get(b"visited").unwrap(), Bytes::from("yes"));
        es.close().await;
    }

    #[tokio::test]
    async fn test_interject_unassigned_partition_fails() {
        let es = test_source(EventSourceConfig::new("grp", "events"));
        let err = es
            .interject(4, |_| ExecutionState::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Client(_)));
    }

    #[tokio::test]
    async fn test_interject_during_bootstrap_fails() {
        let es = test_source(EventSourceConfig::new("grp", "events"));
        es.assign_partition(0, Box::pin(std::future::pending::<()>()));
        let err = es
            .interject(0, |_| ExecutionState::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Client(_)));
        es.close().await;
    }

    #[tokio::test]
    async fn test_interject_on_revoked_worker_resolves() {
        let es = test_source(EventSourceConfig::new("grp", "events"));
        es.assign_partition(0, ready_waiter());
        wait_ready(&es, 0).await;

        // Revoke the worker underneath a caller racing an interjection: the
        // one-shot callback still resolves the wait.
        let worker = es.worker(0).unwrap();
        worker.revoke();
        worker.terminated().await;
        es.interject(0, |_| ExecutionState::Complete).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_all_partitions() {
        let es = test_source(EventSourceConfig::new("grp", "events"));
        es.assign_partition(0, ready_waiter());
        es.assign_partition(1, ready_waiter());
        es.assign_partition(2, ready_waiter());
        wait_ready(&es, 2).await;

        es.close().await;
        assert!(es.assigned_partitions().is_empty());
        assert_eq!(es.change_log().partition_count(), 0);
        assert!(!es.inner.run_status.is_running());
    }

    #[tokio::test]
    async fn test_change_log_topic_from_config() {
        let es = test_source(EventSourceConfig::new("grp", "events"));
        assert_eq!(es.change_log().topic(), "gkes_change_log_events_grp");
    }

    #[tokio::test]
    async fn test_interjections_apply_to_later_assignments() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let es = test_source(EventSourceConfig::new("grp", "events"));
        es.add_interjection(Duration::from_millis(5), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            ExecutionState::Complete
        });
        es.assign_partition(0, ready_waiter());
        wait_ready(&es, 0).await;

        for _ in 0..600 {
            if fired.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(fired.load(Ordering::SeqCst) >= 2);
        es.close().await;
    }
}
