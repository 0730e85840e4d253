//! Tributary consumes one partition of an offset addressed log, hands every record to a
//! user supplied [Processor] in offset order and checkpoints progress in an [OffsetStore], so a
//! restarted consumer neither reprocesses flushed records nor loses unflushed ones.
//!
//! The building blocks are:
//! - [OffsetStore] persists the last committed offset per [StreamKey].
//! - [DecoderRegistry] turns raw payloads of a topic into messages.
//! - [PartitionReader] fetches raw records from a partition.
//! - [Processor] is the user's sink with `process` and `flush`.
//! - [StreamEngine] ties them together and is driven through a [StreamHandle].

pub use crate::error::{BoxError, Error, Result};
pub use crate::message::{Offset, RawRecord, StreamKey};

mod error;
mod message;

/// Stream tuning and its defaults.
pub mod config;

/// Broker discovery through the coordination service.
pub mod coordinator;

pub mod decoder;

/// Lifecycle of a stream run.
pub mod engine;

/// Prometheus metrics and the HTTP endpoint exposing them.
pub mod metrics;

pub mod offset_store;

pub mod processor;

/// Sources of raw records.
pub mod reader;

/// Backoff strategies used for transient failures.
pub mod retry;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{PoisonPolicy, RetryConfig, StartOffset, StreamConfig};
pub use coordinator::{Coordinator, StaticCoordinator, Topology};
pub use decoder::{Decoder, DecoderRegistry, JsonDecoder, ProtoDecoder};
pub use engine::{EngineFailure, EngineState, RunSummary, StreamEngine, StreamHandle, StreamStatus};
pub use offset_store::{FileOffsetStore, MemoryOffsetStore, OffsetStore};
pub use processor::Processor;
pub use reader::{FileLog, MemoryLog, PartitionReader};
