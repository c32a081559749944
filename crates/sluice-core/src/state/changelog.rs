//! Change-log bookkeeping for partition state stores.
//!
//! A [`ChangeLog`] maps partition ids to [`ChangeLogPartition`] handles over
//! a compacted Kafka topic. State mutations become change records
//! (tombstones for deletes) emitted through the same producer transaction
//! as the handler's output, and bootstrap replays the topic back into a
//! fresh store before the partition goes active.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use tracing::warn;

use super::{StateError, StateStore};
use crate::record::{Record, TopicPartition};

/// The set of per-partition state stores behind one compacted topic.
pub struct ChangeLog<S> {
    topic: String,
    factory: Box<dyn Fn() -> S + Send + Sync>,
    partitions: Mutex<FxHashMap<i32, ChangeLogPartition<S>>>,
}

impl<S: StateStore> ChangeLog<S> {
    /// Creates a change log over `topic`. `factory` builds an empty store
    /// whenever a partition is assigned for the first time (or re-assigned
    /// after eviction).
    pub fn new(topic: impl Into<String>, factory: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self {
            topic: topic.into(),
            factory: Box::new(factory),
            partitions: Mutex::new(FxHashMap::default()),
        }
    }

    /// The compacted topic backing this change log.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the handle for `partition`, creating an empty store if this
    /// partition has not been seen (or was evicted).
    #[must_use]
    pub fn partition(&self, partition: i32) -> ChangeLogPartition<S> {
        let mut partitions = self.partitions.lock();
        partitions
            .entry(partition)
            .or_insert_with(|| {
                ChangeLogPartition::new(
                    (self.factory)(),
                    TopicPartition::new(self.topic.clone(), partition),
                )
            })
            .clone()
    }

    /// Drops the store for a revoked partition. The next owner of the
    /// partition rebuilds it by replaying the change-log topic.
    pub fn evict(&self, partition: i32) {
        self.partitions.lock().remove(&partition);
    }

    /// Number of partitions with live state.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.lock().len()
    }
}

impl<S> std::fmt::Debug for ChangeLog<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLog")
            .field("topic", &self.topic)
            .field("partitions", &self.partitions.lock().len())
            .finish_non_exhaustive()
    }
}

/// Handle to one partition's state store and its change-log destination.
pub struct ChangeLogPartition<S> {
    inner: Arc<PartitionInner<S>>,
}

struct PartitionInner<S> {
    store: Mutex<S>,
    topic_partition: TopicPartition,
}

impl<S> Clone for ChangeLogPartition<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: StateStore> ChangeLogPartition<S> {
    /// Wraps a store with its change-log topic-partition.
    #[must_use]
    pub fn new(store: S, topic_partition: TopicPartition) -> Self {
        Self {
            inner: Arc::new(PartitionInner {
                store: Mutex::new(store),
                topic_partition,
            }),
        }
    }

    /// The change-log topic-partition mutations are published to.
    #[must_use]
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.inner.topic_partition
    }

    /// Locks the store for reading or mutation. The guard must not be held
    /// across an await point.
    #[must_use]
    pub fn store(&self) -> MutexGuard<'_, S> {
        self.inner.store.lock()
    }

    /// Builds the change record mirroring a mutation of `key`. A `None`
    /// value is a tombstone, letting compaction drop the key.
    #[must_use]
    pub fn change_record(&self, key: impl Into<bytes::Bytes>, value: Option<bytes::Bytes>) -> Record {
        let mut record = Record::new(self.inner.topic_partition.topic.clone())
            .with_partition(self.inner.topic_partition.partition)
            .with_key(key);
        if let Some(value) = value {
            record = record.with_value(value);
        }
        record
    }

    /// Applies one change-log record during bootstrap: a valued record is a
    /// put, a tombstone a delete. Keyless records are malformed and skipped.
    pub fn replay(&self, record: &Record) -> Result<(), StateError> {
        let Some(key) = record.key() else {
            warn!(
                topic_partition = %self.inner.topic_partition,
                offset = record.offset(),
                "skipping change-log record without a key"
            );
            return Ok(());
        };
        let mut store = self.inner.store.lock();
        match record.value() {
            Some(value) => store.put(key, value),
            None => store.delete(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStore;
    use bytes::Bytes;

    fn test_change_log() -> ChangeLog<InMemoryStore> {
        ChangeLog::new("gkes_change_log_events_grp", InMemoryStore::new)
    }

    #[test]
    fn test_partition_get_or_create() {
        let log = test_change_log();
        assert_eq!(log.partition_count(), 0);

        let p0 = log.partition(0);
        let p0_again = log.partition(0);
        assert_eq!(log.partition_count(), 1);

        p0.store().put(b"k", b"v").unwrap();
        assert_eq!(p0_again.store().get(b"k").unwrap(), Bytes::from("v"));
    }

    #[test]
    fn test_evict_drops_state() {
        let log = test_change_log();
        log.partition(3).store().put(b"k", b"v").unwrap();
        log.evict(3);
        assert_eq!(log.partition_count(), 0);

        // A re-assignment starts from an empty store.
        assert!(log.partition(3).store().get(b"k").is_none());
    }

    #[test]
    fn test_change_record_put() {
        let log = test_change_log();
        let partition = log.partition(2);
        let record = partition.change_record(Bytes::from_static(b"k"), Some(Bytes::from_static(b"v")));
        assert_eq!(record.topic(), "gkes_change_log_events_grp");
        assert_eq!(record.partition(), 2);
        assert_eq!(record.key().unwrap().as_ref(), b"k");
        assert_eq!(record.value().unwrap().as_ref(), b"v");
    }

    #[test]
    fn test_change_record_tombstone() {
        let log = test_change_log();
        let record = log
            .partition(0)
            .change_record(Bytes::from_static(b"gone"), None);
        assert!(record.value().is_none());
    }

    #[test]
    fn test_replay_put_and_tombstone() {
        let log = test_change_log();
        let partition = log.partition(1);
        let tp = partition.topic_partition().clone();

        partition
            .replay(&Record::fetched(
                &tp,
                0,
                Some(Bytes::from_static(b"k")),
                Some(Bytes::from_static(b"v1")),
            ))
            .unwrap();
        assert_eq!(partition.store().get(b"k").unwrap(), Bytes::from("v1"));

        partition
            .replay(&Record::fetched(&tp, 1, Some(Bytes::from_static(b"k")), None))
            .unwrap();
        assert!(partition.store().get(b"k").is_none());
    }

    #[test]
    fn test_replay_skips_keyless_record() {
        let log = test_change_log();
        let partition = log.partition(0);
        let tp = partition.topic_partition().clone();

        partition
            .replay(&Record::fetched(&tp, 0, None, Some(Bytes::from_static(b"v"))))
            .unwrap();
        assert!(partition.store().is_empty());
    }

    #[test]
    fn test_partitions_are_independent() {
        let log = test_change_log();
        log.partition(0).store().put(b"k", b"zero").unwrap();
        log.partition(1).store().put(b"k", b"one").unwrap();
        assert_eq!(log.partition(0).store().get(b"k").unwrap(), Bytes::from("zero"));
        assert_eq!(log.partition(1).store().get(b"k").unwrap(), Bytes::from("one"));
    }
}
