//! Pull side of a stream. A [PartitionReader] returns raw records of one topic partition starting
//! at a requested offset; decoding and ordering guarantees are left to the engine.

use async_trait::async_trait;

use crate::Result;
use crate::message::{Offset, RawRecord};

/// In-process partitions with append and compaction.
pub mod memory;

/// Partitions stored as JSON line segment files.
pub mod file;

pub use file::FileLog;
pub use memory::MemoryLog;

/// PartitionReader fetches batches of raw records from a partitioned, offset addressable log.
#[async_trait]
pub trait PartitionReader: Send + Sync {
    /// Returns up to `max_batch` records with offsets `>= from`, in strictly increasing offset
    /// order. Implementations may block up to their poll timeout and return an empty batch when
    /// nothing arrives.
    ///
    /// Fails with [crate::Error::PartitionUnavailable] when the partition cannot be reached right
    /// now, and with [crate::Error::OffsetOutOfRange] when `from` is no longer retained.
    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        from: Offset,
        max_batch: usize,
    ) -> Result<Vec<RawRecord>>;

    /// First offset still retained by the partition.
    async fn earliest_offset(&self, topic: &str, partition: u32) -> Result<Offset>;
}
