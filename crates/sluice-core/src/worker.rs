//! Per-partition processing workers.
//!
//! A [`PartitionWorker`] activates when a topic-partition is assigned,
//! bootstraps its state store from the change-log topic, then pumps records
//! and interjections through the user handler under the producer pool's
//! exactly-once guarantees, and drains cleanly on revocation.
//!
//! Two long-lived tasks cooperate per worker:
//!
//! - the **ingress loop** turns record batches and interjection firings into
//!   event contexts, admitting them to the producer pool in strict offset
//!   order. Its only suspension point while consuming a batch is the
//!   `max_pending` token channel, which bounds in-flight contexts to the
//!   pool's admission ceiling.
//! - the **dispatch loop** runs the user handlers. While waiting for a
//!   producer slot it keeps draining async completions, because those
//!   completions are what frees producer slots; blocking there would
//!   deadlock the pool.
//!
//! Revocation halts the worker's forked [`RunStatus`], cancels its timers,
//! and waits for every created context to be claimed or abandoned by the
//! pool before tearing the channels down.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::event_context::EventContext;
use crate::event_source::{BootstrapWaiter, EventSourceInner};
use crate::execution::{AsyncJob, ExecutionState};
use crate::interjection::Interjection;
use crate::producer::ProducerSlot;
use crate::record::{Record, TopicPartition};
use crate::run_status::RunStatus;
use crate::state::{ChangeLogPartition, StateStore};

/// Capacity of the per-record event input for a given transaction batch
/// bound.
pub(crate) fn event_input_capacity(max_batch_size: usize) -> usize {
    (max_batch_size / 10).max(100)
}

/// Counts contexts that exist but have not yet been claimed or abandoned by
/// the producer pool. Revocation completes when this reaches zero.
#[derive(Clone)]
pub(crate) struct PendingContexts {
    inner: Arc<PendingInner>,
}

struct PendingInner {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingContexts {
    fn new() -> Self {
        Self {
            inner: Arc::new(PendingInner {
                count: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    fn add(&self, n: usize) {
        self.inner.count.fetch_add(n, Ordering::AcqRel);
    }

    fn done(&self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            if self.count() == 0 {
                return;
            }
            let notified = self.inner.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct WorkerShared {
    ready: AtomicBool,
    highest_offset: AtomicI64,
    pending: PendingContexts,
}

/// Handle to the processing core of one assigned topic-partition.
///
/// Cloning is cheap; all clones drive the same worker.
pub struct PartitionWorker<S: StateStore> {
    topic_partition: TopicPartition,
    run_status: RunStatus,
    shared: Arc<WorkerShared>,
    partition_input: mpsc::Sender<Vec<Record>>,
    interjection_input: mpsc::Sender<Arc<Interjection<S>>>,
    terminated: watch::Receiver<bool>,
}

impl<S: StateStore> Clone for PartitionWorker<S> {
    fn clone(&self) -> Self {
        Self {
            topic_partition: self.topic_partition.clone(),
            run_status: self.run_status.clone(),
            shared: Arc::clone(&self.shared),
            partition_input: self.partition_input.clone(),
            interjection_input: self.interjection_input.clone(),
            terminated: self.terminated.clone(),
        }
    }
}

impl<S: StateStore> PartitionWorker<S> {
    /// Spawns the worker for `partition`. `waiter` resolves once the state
    /// store has been hydrated from the change-log topic; fetching stays
    /// paused until then.
    pub(crate) fn new(
        es: Arc<EventSourceInner<S>>,
        partition: i32,
        change_log: ChangeLogPartition<S>,
        waiter: BootstrapWaiter,
    ) -> Self {
        let topic_partition = TopicPartition::new(es.source.topic().to_string(), partition);
        let event_capacity = event_input_capacity(es.source.config().eos.max_batch_size);
        let async_capacity = event_capacity * 4;
        let max_pending_capacity = es.producer_pool.max_pending_items().max(1);

        let (partition_tx, partition_rx) = mpsc::channel(4);
        let (event_tx, event_rx) = mpsc::channel(event_capacity);
        let (interjection_tx, interjection_rx) = mpsc::channel(1);
        let (interjection_event_tx, interjection_event_rx) = mpsc::channel(1);
        let (async_tx, async_rx) = mpsc::channel(async_capacity);
        let (max_pending_tx, max_pending_rx) = mpsc::channel(max_pending_capacity);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (stopped_tx, stopped_rx) = mpsc::channel(1);
        let (revoked_tx, revoked_rx) = mpsc::channel(1);
        let (terminated_tx, terminated_rx) = watch::channel(false);

        let run_status = es.run_status.fork();
        let shared = Arc::new(WorkerShared {
            ready: AtomicBool::new(false),
            highest_offset: AtomicI64::new(-1),
            pending: PendingContexts::new(),
        });
        let interjections = es.interjection_instances();

        let ingress = Ingress {
            es: Arc::clone(&es),
            shared: Arc::clone(&shared),
            run_status: run_status.clone(),
            topic_partition: topic_partition.clone(),
            change_log,
            partition_rx,
            interjection_rx,
            event_tx,
            interjection_event_tx,
            async_tx,
            max_pending_tx,
            stop_tx,
            stopped_rx,
            terminated_tx,
        };
        let dispatch = Dispatch {
            es,
            shared: Arc::clone(&shared),
            run_status: run_status.clone(),
            topic_partition: topic_partition.clone(),
            interjections,
            interjection_tx: interjection_tx.clone(),
            event_rx,
            interjection_event_rx,
            async_rx,
            max_pending_rx,
            stop_rx,
            revoked_tx,
            revoked_rx,
            stopped_tx,
        };
        tokio::spawn(run_worker(dispatch, ingress, waiter));

        Self {
            topic_partition,
            run_status,
            shared,
            partition_input: partition_tx,
            interjection_input: interjection_tx,
            terminated: terminated_rx,
        }
    }

    /// The partition this worker owns.
    #[must_use]
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// Offers a batch of records for this partition. No-op once revoked;
    /// otherwise suspends when the partition input buffer is full.
    pub async fn add(&self, records: Vec<Record>) {
        if self.is_revoked() {
            return;
        }
        let _ = self.partition_input.send(records).await;
    }

    /// Begins graceful shutdown. Returns immediately; observe completion
    /// with [`PartitionWorker::terminated`].
    pub fn revoke(&self) {
        self.run_status.halt();
    }

    /// Returns `true` once the state store is bootstrapped and the worker
    /// can process interjections.
    #[must_use]
    pub fn can_interject(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Resolves once the worker has fully drained and torn down.
    pub async fn terminated(&self) {
        let mut terminated = self.terminated.clone();
        loop {
            if *terminated.borrow_and_update() {
                return;
            }
            if terminated.changed().await.is_err() {
                // Worker task is gone; nothing left to wait for.
                return;
            }
        }
    }

    pub(crate) fn is_revoked(&self) -> bool {
        !self.run_status.is_running()
    }

    /// Enqueues an ad-hoc interjection, resolving its callback immediately
    /// when the worker is already revoked or torn down.
    pub(crate) async fn offer_interjection(&self, interjection: Arc<Interjection<S>>) {
        if self.is_revoked() {
            interjection.fire_callback();
            return;
        }
        if let Err(rejected) = self.interjection_input.send(interjection).await {
            rejected.0.fire_callback();
        }
    }

    pub(crate) fn highest_offset(&self) -> i64 {
        self.shared.highest_offset.load(Ordering::Acquire)
    }

    pub(crate) fn pending_contexts(&self) -> usize {
        self.shared.pending.count()
    }
}

impl<S: StateStore> std::fmt::Debug for PartitionWorker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionWorker")
            .field("topic_partition", &self.topic_partition)
            .field("ready", &self.can_interject())
            .field("revoked", &self.is_revoked())
            .finish_non_exhaustive()
    }
}

/// Bootstraps the partition, then runs the dispatch loop to completion.
async fn run_worker<S: StateStore>(
    mut dispatch: Dispatch<S>,
    ingress: Ingress<S>,
    waiter: BootstrapWaiter,
) {
    let started = Instant::now();
    let topic_partition = dispatch.topic_partition.clone();

    // The worker is attached to the consumer before its state store is
    // usable. Fetches are multiplexed per consumer, so filling this
    // partition's buffer during hydration would stall delivery to the
    // already-active partitions sharing the client.
    dispatch.es.consumer.pause_partition(&topic_partition);
    tokio::select! {
        () = waiter => {}
        () = dispatch.run_status.done() => {
            debug!(
                topic_partition = %topic_partition,
                "partition revoked before state store hydration finished"
            );
            let _ = ingress.terminated_tx.send(true);
            return;
        }
    }
    dispatch.es.consumer.resume_partition(&topic_partition);

    let activated_source = Arc::clone(&dispatch.es.source);
    let partition = topic_partition.partition;
    tokio::spawn(ingress.run());
    dispatch.shared.ready.store(true, Ordering::Release);
    debug!(
        topic_partition = %topic_partition,
        elapsed = ?started.elapsed(),
        interjections = dispatch.interjections.len(),
        "partition worker activated"
    );

    let token = dispatch.run_status.token();
    for interjection in &dispatch.interjections {
        interjection.init(
            topic_partition.clone(),
            dispatch.interjection_tx.clone(),
            &token,
        );
        interjection.tick();
    }
    activated_source.on_partition_activated(partition);

    dispatch.run().await;
}

/// The ingress half: record batches and interjection firings in, event
/// contexts out.
struct Ingress<S: StateStore> {
    es: Arc<EventSourceInner<S>>,
    shared: Arc<WorkerShared>,
    run_status: RunStatus,
    topic_partition: TopicPartition,
    change_log: ChangeLogPartition<S>,
    partition_rx: mpsc::Receiver<Vec<Record>>,
    interjection_rx: mpsc::Receiver<Arc<Interjection<S>>>,
    event_tx: mpsc::Sender<EventContext<S>>,
    interjection_event_tx: mpsc::Sender<EventContext<S>>,
    async_tx: mpsc::Sender<AsyncJob<S>>,
    max_pending_tx: mpsc::Sender<()>,
    stop_tx: mpsc::Sender<()>,
    stopped_rx: mpsc::Receiver<()>,
    terminated_tx: watch::Sender<bool>,
}

impl<S: StateStore> Ingress<S> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(records) = self.partition_rx.recv() => {
                    if self.run_status.is_running() {
                        self.schedule_batch(records).await;
                    }
                }
                Some(interjection) = self.interjection_rx.recv() => {
                    self.schedule_interjection(interjection).await;
                }
                () = self.run_status.done() => {
                    debug!(topic_partition = %self.topic_partition, "stopping partition worker");
                    let _ = self.stop_tx.send(()).await;
                    let _ = self.stopped_rx.recv().await;
                    debug!(topic_partition = %self.topic_partition, "partition worker stopped");
                    let _ = self.terminated_tx.send(true);
                    return;
                }
            }
        }
    }

    /// Admits one batch: per record, suppress stale duplicates, create the
    /// context, take a `max_pending` token, and hand the reservation to the
    /// pool, in that order, so pool admission stays in offset order.
    async fn schedule_batch(&mut self, records: Vec<Record>) {
        if !self.run_status.is_running() {
            return;
        }
        // One optimistic add for the whole batch; stale records give their
        // share back below.
        self.shared.pending.add(records.len());
        for record in records {
            if record.offset() >= self.shared.highest_offset.load(Ordering::Acquire) {
                let (ec, reservation) = EventContext::for_record(
                    self.run_status.token(),
                    record,
                    self.change_log.clone(),
                    self.async_tx.clone(),
                );
                let _ = self.max_pending_tx.send(()).await;
                self.es.producer_pool.add_event_context(reservation).await;
                let _ = self.event_tx.send(ec).await;
            } else {
                // Redelivered duplicate after a partial commit.
                self.shared.pending.done();
            }
            // Sustained record traffic would otherwise starve the
            // single-slot interjection input.
            self.interleave_interjection().await;
        }
    }

    async fn interleave_interjection(&mut self) {
        if let Ok(interjection) = self.interjection_rx.try_recv() {
            self.schedule_interjection(interjection).await;
        }
    }

    async fn schedule_interjection(&mut self, interjection: Arc<Interjection<S>>) {
        if !self.run_status.is_running() {
            // Resolve one-off interjections so external waiters unblock.
            interjection.fire_callback();
            return;
        }
        self.shared.pending.add(1);
        let (ec, reservation) = EventContext::for_interjection(
            self.run_status.token(),
            interjection,
            self.topic_partition.clone(),
            self.change_log.clone(),
            self.async_tx.clone(),
        );
        let _ = self.max_pending_tx.send(()).await;
        self.es.producer_pool.add_event_context(reservation).await;
        let _ = self.interjection_event_tx.send(ec).await;
    }
}

/// The dispatch half: runs user handlers and finalizers, tracks the highest
/// scheduled offset, and orchestrates the revocation drain.
struct Dispatch<S: StateStore> {
    es: Arc<EventSourceInner<S>>,
    shared: Arc<WorkerShared>,
    run_status: RunStatus,
    topic_partition: TopicPartition,
    interjections: Vec<Arc<Interjection<S>>>,
    interjection_tx: mpsc::Sender<Arc<Interjection<S>>>,
    event_rx: mpsc::Receiver<EventContext<S>>,
    interjection_event_rx: mpsc::Receiver<EventContext<S>>,
    async_rx: mpsc::Receiver<AsyncJob<S>>,
    max_pending_rx: mpsc::Receiver<()>,
    stop_rx: mpsc::Receiver<()>,
    revoked_tx: mpsc::Sender<()>,
    revoked_rx: mpsc::Receiver<()>,
    stopped_tx: mpsc::Sender<()>,
}

impl<S: StateStore> Dispatch<S> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(ec) = self.event_rx.recv() => self.handle_event(ec).await,
                Some(ec) = self.interjection_event_rx.recv() => self.handle_interjection(ec).await,
                Some(job) = self.async_rx.recv() => self.process_async_job(job),
                Some(()) = self.stop_rx.recv() => {
                    for interjection in &self.interjections {
                        interjection.cancel();
                    }
                    // Keep draining from here; the watcher flags us once
                    // every created context has been claimed or abandoned.
                    let pending = self.shared.pending.clone();
                    let revoked_tx = self.revoked_tx.clone();
                    tokio::spawn(async move {
                        pending.wait_idle().await;
                        let _ = revoked_tx.send(()).await;
                    });
                }
                Some(()) = self.revoked_rx.recv() => {
                    let _ = self.stopped_tx.send(()).await;
                    return;
                }
            }
        }
    }

    async fn handle_event(&mut self, ec: EventContext<S>) {
        if self.assign_producer(&ec).await.is_none() {
            // Revoked before a producer claimed it; the token goes back
            // unused.
            self.release_pending_token();
            return;
        }
        if let Some(offset) = ec.offset() {
            self.shared
                .highest_offset
                .store(offset + 1, Ordering::Release);
        }
        let state = match ec.input() {
            Some(record) => (self.es.processor)(&ec, record),
            None => ExecutionState::Complete,
        };
        self.settle(&ec, state);
    }

    async fn handle_interjection(&mut self, ec: EventContext<S>) {
        let Some(interjection) = ec.interjection().cloned() else {
            return;
        };
        if self.assign_producer(&ec).await.is_none() {
            self.release_pending_token();
            // Close out one-off interjections so external callers never
            // hang on a revoked partition.
            interjection.fire_callback();
            return;
        }
        let state = interjection.interject(&ec);
        self.settle(&ec, state);
    }

    /// Waits for the pool to resolve the context's producer reservation.
    ///
    /// Async completions are what release producer capacity, and this loop
    /// is the only consumer of them, so while waiting, keep processing
    /// async jobs instead of blocking outright.
    async fn assign_producer(&mut self, ec: &EventContext<S>) -> Option<ProducerSlot> {
        let Some(mut slot_rx) = ec.take_slot_receiver() else {
            return ec.producer();
        };
        loop {
            tokio::select! {
                resolved = &mut slot_rx => {
                    // Claimed or abandoned either way: the pool is done
                    // with this reservation.
                    self.shared.pending.done();
                    let slot = resolved.unwrap_or(None);
                    ec.set_producer(slot.clone());
                    return slot;
                }
                Some(job) = self.async_rx.recv() => self.process_async_job(job),
            }
        }
    }

    fn process_async_job(&mut self, job: AsyncJob<S>) {
        let (ec, state) = job.finalize();
        self.settle(&ec, state);
    }

    /// Applies a handler or finalizer outcome to its context. A completed
    /// interjection re-arms its timer (periodic) or resolves its callback
    /// (one-shot).
    fn settle(&mut self, ec: &EventContext<S>, state: ExecutionState) {
        match state {
            ExecutionState::Complete => {
                ec.complete();
                self.release_pending_token();
                if let Some(interjection) = ec.interjection() {
                    if interjection.is_periodic() {
                        interjection.tick();
                    } else {
                        interjection.fire_callback();
                    }
                }
            }
            ExecutionState::Fatal => {
                warn!(
                    topic_partition = %self.topic_partition,
                    offset = ?ec.offset(),
                    "handler returned a fatal state"
                );
                self.release_pending_token();
                if let Some(interjection) = ec.interjection() {
                    interjection.fire_callback();
                }
                self.es.source.fail(SourceError::HandlerFatal {
                    topic_partition: self.topic_partition.clone(),
                });
            }
            // The application promised to fulfill the context later.
            ExecutionState::Incomplete | ExecutionState::Unknown => {}
        }
    }

    fn release_pending_token(&mut self) {
        // Pairs with a token the ingress loop deposited before this context
        // reached the dispatch loop.
        let _ = self.max_pending_rx.try_recv();
    }
}
