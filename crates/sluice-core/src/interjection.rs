//! Timer-driven interjections.
//!
//! An interjection is a pseudo-event scoped to one partition: on a timer it
//! enqueues itself on the owning worker's interjection input and flows
//! through the same context/producer machinery as a record, so it can read
//! and mutate partition state under the same transactional guarantees.
//! Periodic interjections are re-armed by the worker after each completed
//! firing; one-shot interjections carry a callback that is invoked exactly
//! once on every outcome so external callers can never hang.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::event_context::EventContext;
use crate::execution::ExecutionState;
use crate::record::TopicPartition;
use crate::state::StateStore;

/// The user-supplied function run when an interjection fires.
pub type Interjector<S> = Arc<dyn Fn(&EventContext<S>) -> ExecutionState + Send + Sync>;

type OneShotCallback = Box<dyn FnOnce() + Send>;

struct Binding<S: StateStore> {
    topic_partition: TopicPartition,
    input: mpsc::Sender<Arc<Interjection<S>>>,
    cancel: CancellationToken,
}

/// A periodic or one-shot timer event bound to a single partition.
pub struct Interjection<S: StateStore> {
    interval: Duration,
    periodic: bool,
    interjector: Interjector<S>,
    callback: Mutex<Option<OneShotCallback>>,
    binding: OnceLock<Binding<S>>,
}

impl<S: StateStore> Interjection<S> {
    /// Creates a recurring interjection firing every `interval`.
    pub(crate) fn periodic(interval: Duration, interjector: Interjector<S>) -> Self {
        Self {
            interval,
            periodic: true,
            interjector,
            callback: Mutex::new(None),
            binding: OnceLock::new(),
        }
    }

    /// Creates a one-shot interjection. `callback` runs exactly once, when
    /// the interjection has been processed, abandoned, or cancelled.
    pub(crate) fn one_shot(interjector: Interjector<S>, callback: OneShotCallback) -> Self {
        Self {
            interval: Duration::ZERO,
            periodic: false,
            interjector,
            callback: Mutex::new(Some(callback)),
            binding: OnceLock::new(),
        }
    }

    /// Whether the worker should re-arm this interjection after a completed
    /// firing.
    #[must_use]
    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    /// The firing interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The partition this interjection is bound to, once initialized.
    #[must_use]
    pub fn topic_partition(&self) -> Option<&TopicPartition> {
        self.binding.get().map(|b| &b.topic_partition)
    }

    /// Binds this interjection to a worker's interjection input. Called once
    /// during partition activation; `parent` scopes the timer's lifetime to
    /// the worker.
    pub(crate) fn init(
        &self,
        topic_partition: TopicPartition,
        input: mpsc::Sender<Arc<Interjection<S>>>,
        parent: &CancellationToken,
    ) {
        let bound = self
            .binding
            .set(Binding {
                topic_partition,
                input,
                cancel: parent.child_token(),
            })
            .is_ok();
        if !bound {
            warn!("interjection initialized twice; keeping the original binding");
        }
    }

    /// Arms the next firing: after `interval`, the interjection enqueues
    /// itself on the worker's interjection input. No-op before `init` or
    /// after `cancel`.
    pub(crate) fn tick(self: &Arc<Self>) {
        let Some(binding) = self.binding.get() else {
            return;
        };
        if binding.cancel.is_cancelled() {
            return;
        }
        let this = Arc::clone(self);
        let cancel = binding.cancel.clone();
        let input = binding.input.clone();
        let delay = self.interval;
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        sent = input.send(this) => {
                            if let Err(err) = sent {
                                // Worker already tore down its input.
                                err.0.fire_callback();
                            }
                        }
                    }
                }
            }
        });
    }

    /// Disarms the timer. A pending one-shot callback fires now so that
    /// external waiters unblock.
    pub(crate) fn cancel(&self) {
        if let Some(binding) = self.binding.get() {
            binding.cancel.cancel();
        }
        self.fire_callback();
    }

    /// Runs the user interjector against `ec`.
    pub(crate) fn interject(&self, ec: &EventContext<S>) -> ExecutionState {
        (self.interjector)(ec)
    }

    /// Invokes the one-shot callback if it has not fired yet.
    pub(crate) fn fire_callback(&self) {
        if let Some(callback) = self.callback.lock().take() {
            callback();
        }
    }
}

impl<S: StateStore> std::fmt::Debug for Interjection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interjection")
            .field("interval", &self.interval)
            .field("periodic", &self.periodic)
            .field("topic_partition", &self.topic_partition())
            .finish_non_exhaustive()
    }
}
