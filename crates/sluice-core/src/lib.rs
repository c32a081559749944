//! # sluice-core
//!
//! The per-partition processing core of a Kafka event-sourcing runtime.
//!
//! Records consumed in a consumer group are pumped through a user-supplied
//! event processor that can read and mutate partition-scoped state; output
//! records, state mutations, and offsets commit atomically through a shared
//! transactional producer pool, giving exactly-once semantics end to end.
//!
//! The moving parts:
//!
//! - [`EventSource`] owns the consumer group's workers and routes records,
//!   interjections, and lifecycle events to them.
//! - [`PartitionWorker`] is the per-partition state machine: state-store
//!   bootstrap with fetches paused, in-order admission to the producer
//!   pool, bounded in-flight processing, and a graceful revocation drain.
//! - [`EventContext`] is the per-record (or per-interjection) handle given
//!   to handlers: partition state, output forwarding, async completion.
//! - [`ProducerPool`] is the contract for the transactional producer pool,
//!   which lives outside this crate.
//!
//! Kafka client plumbing (consumer construction, rebalance listeners,
//! record conversion) lives in the companion `sluice-kafka` crate.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod event_context;
pub mod event_source;
pub mod execution;
pub mod interjection;
pub mod producer;
pub mod record;
pub mod run_status;
pub mod source;
pub mod state;
pub mod worker;

pub use error::SourceError;
pub use event_context::EventContext;
pub use event_source::{BootstrapWaiter, ConsumerClient, EventProcessor, EventSource};
pub use execution::{AsyncJob, ExecutionState};
pub use interjection::{Interjection, Interjector};
pub use producer::{ProducerNode, ProducerPool, ProducerSlot, SlotReservation};
pub use record::{Record, RecordHeader, TopicPartition};
pub use run_status::RunStatus;
pub use source::{
    BalanceStrategy, DeserializationErrorHandler, EosConfig, ErrorResponse, EventSourceConfig,
    EventSourceState, Source, SourcePartitionEventHandler, TxnErrorHandler,
};
pub use state::{ChangeLog, ChangeLogPartition, InMemoryStore, StateError, StateStore};
pub use worker::PartitionWorker;
