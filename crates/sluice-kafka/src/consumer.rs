//! Consumer construction, pause/resume control, and the reader task.

use std::sync::Arc;

use bytes::Bytes;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sluice_core::{ConsumerClient, EventSource, Record, Source, StateStore, TopicPartition};

use crate::context::SluiceConsumerContext;

/// Builds the rdkafka consumer configuration for a source.
///
/// Offsets are managed on the commit-log topic, so group auto-commit is
/// off; `read_committed` isolation keeps aborted transactions invisible.
#[must_use]
pub fn consumer_config(source: &Source, bootstrap_servers: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", bootstrap_servers)
        .set("group.id", source.group_id())
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("isolation.level", "read_committed");

    let strategies: Vec<&str> = source
        .config()
        .balance_strategies
        .iter()
        .map(|strategy| strategy.protocol_name())
        .collect();
    if !strategies.is_empty() {
        config.set("partition.assignment.strategy", strategies.join(","));
    }
    config
}

/// [`ConsumerClient`] over an rdkafka `StreamConsumer`.
///
/// Partition workers pause their partition while the state store hydrates
/// and resume it afterwards; both calls are single-partition and safe from
/// any task.
pub struct KafkaConsumerClient {
    consumer: Arc<StreamConsumer<SluiceConsumerContext>>,
}

impl KafkaConsumerClient {
    /// Wraps a stream consumer.
    #[must_use]
    pub fn new(consumer: Arc<StreamConsumer<SluiceConsumerContext>>) -> Self {
        Self { consumer }
    }

    fn single_partition_list(topic_partition: &TopicPartition) -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        list.add_partition(&topic_partition.topic, topic_partition.partition);
        list
    }
}

impl ConsumerClient for KafkaConsumerClient {
    fn pause_partition(&self, topic_partition: &TopicPartition) {
        let list = Self::single_partition_list(topic_partition);
        if let Err(err) = self.consumer.pause(&list) {
            warn!(
                topic_partition = %topic_partition,
                error = %err,
                "failed to pause partition fetch"
            );
        }
    }

    fn resume_partition(&self, topic_partition: &TopicPartition) {
        let list = Self::single_partition_list(topic_partition);
        if let Err(err) = self.consumer.resume(&list) {
            warn!(
                topic_partition = %topic_partition,
                error = %err,
                "failed to resume partition fetch"
            );
        }
    }
}

impl std::fmt::Debug for KafkaConsumerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConsumerClient").finish_non_exhaustive()
    }
}

/// Converts a fetched message into an owned [`Record`], detaching it from
/// the consumer's buffers.
#[must_use]
pub fn record_from_message(message: &BorrowedMessage<'_>) -> Record {
    let topic_partition = TopicPartition::new(message.topic(), message.partition());
    let mut record = Record::fetched(
        &topic_partition,
        message.offset(),
        message.key().map(Bytes::copy_from_slice),
        message.payload().map(Bytes::copy_from_slice),
    );
    if let Some(timestamp_ms) = message.timestamp().to_millis() {
        record = record.with_timestamp_ms(timestamp_ms);
    }
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            if let Some(value) = header.value {
                record = record.with_header(header.key, Bytes::copy_from_slice(value));
            }
        }
    }
    record
}

/// Spawns the reader task: fetched messages are converted and routed to the
/// owning partition worker until `shutdown` fires.
///
/// Worker backpressure propagates here: a partition whose input buffer is
/// full suspends the reader, which in turn lets the broker's flow control
/// take over.
pub fn spawn_reader<S: StateStore>(
    consumer: Arc<StreamConsumer<SluiceConsumerContext>>,
    event_source: EventSource<S>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                fetched = consumer.recv() => match fetched {
                    Ok(message) => {
                        let partition = message.partition();
                        let record = record_from_message(&message);
                        drop(message);
                        event_source.add_records(partition, vec![record]).await;
                    }
                    Err(err) => {
                        warn!(error = %err, "kafka consumer error");
                    }
                },
            }
        }
        consumer.unsubscribe();
        info!("kafka reader stopped");
    })
}
