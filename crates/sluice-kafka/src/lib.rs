//! # sluice-kafka
//!
//! The rdkafka-facing edge of the sluice event-sourcing runtime: consumer
//! construction tuned for exactly-once consumption, a rebalance-aware
//! consumer context that surfaces assignment changes on a channel, message
//! conversion into owned [`sluice_core::Record`]s, and a reader task that
//! feeds an [`sluice_core::EventSource`].
//!
//! Everything here is plumbing around the `sluice-core` contracts; the
//! processing semantics live in that crate.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod consumer;
pub mod context;

pub use consumer::{consumer_config, record_from_message, spawn_reader, KafkaConsumerClient};
pub use context::{RebalanceEvent, SluiceConsumerContext};
