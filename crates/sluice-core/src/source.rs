//! Source configuration, health, and derived Kafka identifiers.
//!
//! [`Source`] is the read-only wrapper an event source and its partition
//! workers share: validated configuration, atomic health state, the
//! single-shot failure signal, topic-name derivation, and dispatch of the
//! partition lifecycle callbacks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::error::SourceError;
use crate::record::Record;

/// Health of an event source. Flips to `Unhealthy` exactly once, on the
/// first unrecoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSourceState {
    /// Processing normally.
    Healthy,
    /// A terminal failure was raised; the source should be torn down.
    Unhealthy,
}

/// Consumer group rebalance strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceStrategy {
    /// Contiguous partition ranges per member.
    Range,
    /// Partitions dealt round-robin across members.
    RoundRobin,
    /// Incremental cooperative rebalancing; avoids stop-the-world
    /// revocations and is the default.
    CooperativeSticky,
}

impl BalanceStrategy {
    /// The Kafka protocol name for this strategy.
    #[must_use]
    pub fn protocol_name(self) -> &'static str {
        match self {
            Self::Range => "range",
            Self::RoundRobin => "roundrobin",
            Self::CooperativeSticky => "cooperative-sticky",
        }
    }
}

/// What an error handler wants the runtime to do with a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorResponse {
    /// Skip the failed unit and keep processing.
    Proceed,
    /// Retry the failed operation.
    Retry,
    /// Escalate to a terminal source failure.
    Fail,
}

/// Invoked when an incoming record cannot be deserialized.
pub type DeserializationErrorHandler =
    Arc<dyn Fn(&Record, &SourceError) -> ErrorResponse + Send + Sync>;

/// Invoked when a producer transaction fails.
pub type TxnErrorHandler = Arc<dyn Fn(&SourceError) -> ErrorResponse + Send + Sync>;

/// Invoked on partition lifecycle events with the partition id.
pub type SourcePartitionEventHandler = Arc<dyn Fn(i32) + Send + Sync>;

/// Tuning for the exactly-once producer pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EosConfig {
    /// Number of pooled transactional producers.
    pub pool_size: usize,
    /// Transactions allowed in flight per producer.
    pub pending_txn_count: usize,
    /// Upper bound on records batched into one transaction. Also drives
    /// worker channel sizing.
    pub max_batch_size: usize,
    /// How long a producer waits for a batch to fill before committing
    /// anyway, in milliseconds.
    pub batch_delay_ms: u64,
}

impl Default for EosConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            pending_txn_count: 1,
            max_batch_size: 10_000,
            batch_delay_ms: 10,
        }
    }
}

impl EosConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] if any bound is zero.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.pool_size == 0 {
            return Err(SourceError::Config("eos pool_size must be > 0".into()));
        }
        if self.pending_txn_count == 0 {
            return Err(SourceError::Config(
                "eos pending_txn_count must be > 0".into(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(SourceError::Config("eos max_batch_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration for an event source.
#[derive(Clone, Default)]
pub struct EventSourceConfig {
    /// Consumer group id.
    pub group_id: String,
    /// Topic to consume.
    pub topic: String,
    /// Compacted topic for state-store data. When unset, a name derived
    /// from `topic` and `group_id` is used.
    pub state_store_topic: Option<String>,
    /// Desired partition count for `topic`.
    pub num_partitions: i32,
    /// Desired replication factor for `topic`. Values ≤ 0 mean 1.
    pub replication_factor: i32,
    /// Desired min-insync-replicas for `topic`, clamped below the
    /// replication factor.
    pub min_in_sync: i32,
    /// Rebalance strategies for the consumer group, in preference order.
    pub balance_strategies: Vec<BalanceStrategy>,
    /// Commit offsets to the consumer group as well as the commit log.
    ///
    /// Only useful while migrating from a traditional consumer group: a
    /// mixed fleet can fall back to the group's committed offsets if the
    /// rollout fails. Once established, leave this off: offsets live on
    /// the commit-log topic and group commits only burn resources.
    pub commit_offsets: bool,
    /// Producer pool tuning.
    pub eos: EosConfig,
    /// Called when a partition is assigned to the consumer. Assignment does
    /// not mean processing has started.
    pub on_partition_assigned: Option<SourcePartitionEventHandler>,
    /// Called when an assigned partition goes active: its state store is
    /// bootstrapped and event processing is about to begin.
    pub on_partition_activated: Option<SourcePartitionEventHandler>,
    /// Called just before a partition is revoked. Blocking; return quickly.
    pub on_partition_will_revoke: Option<SourcePartitionEventHandler>,
    /// Called after a revoked partition has fully drained and its resources
    /// are released.
    pub on_partition_revoked: Option<SourcePartitionEventHandler>,
    /// Handler for records that fail deserialization. Defaults to
    /// skip-and-log.
    pub deserialization_error_handler: Option<DeserializationErrorHandler>,
    /// Handler for producer transaction errors. Defaults to
    /// retry-if-retriable, otherwise fail.
    pub txn_error_handler: Option<TxnErrorHandler>,
}

impl EventSourceConfig {
    /// Creates a configuration for `group_id` consuming `topic`, with
    /// defaults everywhere else.
    #[must_use]
    pub fn new(group_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topic: topic.into(),
            balance_strategies: vec![BalanceStrategy::CooperativeSticky],
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for EventSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourceConfig")
            .field("group_id", &self.group_id)
            .field("topic", &self.topic)
            .field("state_store_topic", &self.state_store_topic)
            .field("num_partitions", &self.num_partitions)
            .field("replication_factor", &self.replication_factor)
            .field("min_in_sync", &self.min_in_sync)
            .field("balance_strategies", &self.balance_strategies)
            .field("commit_offsets", &self.commit_offsets)
            .field("eos", &self.eos)
            .finish_non_exhaustive()
    }
}

/// A validated, read-only view of an [`EventSourceConfig`] plus the runtime
/// health it anchors.
pub struct Source {
    state: AtomicU64,
    config: EventSourceConfig,
    failure_tx: Mutex<Option<oneshot::Sender<SourceError>>>,
    failure_rx: Mutex<Option<oneshot::Receiver<SourceError>>>,
}

impl Source {
    /// Validates `config` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] when the group id or topic is empty
    /// or the EOS tuning is invalid.
    pub fn new(config: EventSourceConfig) -> Result<Self, SourceError> {
        if config.group_id.is_empty() {
            return Err(SourceError::Config("group_id must not be empty".into()));
        }
        if config.topic.is_empty() {
            return Err(SourceError::Config("topic must not be empty".into()));
        }
        config.eos.validate()?;
        let (failure_tx, failure_rx) = oneshot::channel();
        Ok(Self {
            state: AtomicU64::new(0),
            config,
            failure_tx: Mutex::new(Some(failure_tx)),
            failure_rx: Mutex::new(Some(failure_rx)),
        })
    }

    /// The consumed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// The consumer group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    /// The wrapped configuration.
    #[must_use]
    pub fn config(&self) -> &EventSourceConfig {
        &self.config
    }

    /// Desired partition count of the consumed topic.
    #[must_use]
    pub fn num_partitions(&self) -> i32 {
        self.config.num_partitions
    }

    /// Current health.
    #[must_use]
    pub fn state(&self) -> EventSourceState {
        if self.state.load(Ordering::Acquire) == 0 {
            EventSourceState::Healthy
        } else {
            EventSourceState::Unhealthy
        }
    }

    /// Takes the terminal failure receiver. The first caller gets it; the
    /// holder should tear the source down when it resolves.
    #[must_use]
    pub fn take_failure_signal(&self) -> Option<oneshot::Receiver<SourceError>> {
        self.failure_rx.lock().take()
    }

    /// Raises the terminal failure: flips health to unhealthy and delivers
    /// `err` on the failure signal. Later calls only log.
    pub fn fail(&self, err: SourceError) {
        self.state.store(1, Ordering::Release);
        match self.failure_tx.lock().take() {
            Some(tx) => {
                error!(topic = %self.config.topic, error = %err, "event source failed");
                let _ = tx.send(err);
            }
            None => warn!(
                topic = %self.config.topic,
                error = %err,
                "event source already failed; dropping subsequent failure"
            ),
        }
    }

    /// The topic the runtime records processed offsets on, out-of-band from
    /// the consumer group's own commit.
    #[must_use]
    pub fn commit_log_topic_name(&self) -> String {
        format!("gkes_commit_log_{}", self.config.group_id)
    }

    /// The compacted topic backing the state store: the configured override
    /// if set, otherwise derived from the topic and group id.
    #[must_use]
    pub fn state_store_topic_name(&self) -> String {
        match &self.config.state_store_topic {
            Some(topic) if !topic.is_empty() => topic.clone(),
            _ => format!(
                "gkes_change_log_{}_{}",
                self.config.topic, self.config.group_id
            ),
        }
    }

    /// The replication factor to apply when creating topics.
    #[must_use]
    pub fn replication_factor(&self) -> i32 {
        if self.config.replication_factor <= 0 {
            1
        } else {
            self.config.replication_factor
        }
    }

    /// The min-insync-replicas to apply when creating topics, always below
    /// the replication factor.
    #[must_use]
    pub fn min_in_sync(&self) -> i32 {
        let factor = self.replication_factor();
        if factor <= 1 {
            return 1;
        }
        if self.config.min_in_sync >= factor {
            factor - 1
        } else {
            self.config.min_in_sync
        }
    }

    /// Whether consumed offsets should also be marked for consumer-group
    /// commit. Offsets are tracked on the commit-log topic, so this stays
    /// off; see [`EventSourceConfig::commit_offsets`].
    #[must_use]
    pub fn should_mark_commit(&self) -> bool {
        false
    }

    /// The configured deserialization error handler, or the skip-and-log
    /// default.
    #[must_use]
    pub fn deserialization_error_handler(&self) -> DeserializationErrorHandler {
        self.config
            .deserialization_error_handler
            .clone()
            .unwrap_or_else(default_deserialization_error_handler)
    }

    /// The configured transaction error handler, or the
    /// retry-if-retriable default.
    #[must_use]
    pub fn txn_error_handler(&self) -> TxnErrorHandler {
        self.config
            .txn_error_handler
            .clone()
            .unwrap_or_else(default_txn_error_handler)
    }

    pub(crate) fn on_partition_assigned(&self, partition: i32) {
        execute_handler(self.config.on_partition_assigned.as_ref(), partition);
    }

    pub(crate) fn on_partition_activated(&self, partition: i32) {
        execute_handler(self.config.on_partition_activated.as_ref(), partition);
    }

    pub(crate) fn on_partition_will_revoke(&self, partition: i32) {
        execute_handler(self.config.on_partition_will_revoke.as_ref(), partition);
    }

    pub(crate) fn on_partition_revoked(&self, partition: i32) {
        execute_handler(self.config.on_partition_revoked.as_ref(), partition);
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn execute_handler(handler: Option<&SourcePartitionEventHandler>, partition: i32) {
    if let Some(handler) = handler {
        handler(partition);
    }
}

/// Logs the poison record and proceeds.
fn default_deserialization_error_handler() -> DeserializationErrorHandler {
    Arc::new(|record, err| {
        warn!(
            topic = record.topic(),
            partition = record.partition(),
            offset = record.offset(),
            error = %err,
            "skipping undeserializable record"
        );
        ErrorResponse::Proceed
    })
}

/// Retries retriable transaction errors, fails otherwise.
fn default_txn_error_handler() -> TxnErrorHandler {
    Arc::new(|err| {
        if err.is_retriable() {
            ErrorResponse::Retry
        } else {
            ErrorResponse::Fail
        }
    })
}
