//! Durable mapping from a [StreamKey] to the last committed [Offset].
//!
//! The committed offset is the offset of the last record whose effects the processor has
//! flushed, hence a resumed consumer starts reading right after it. Stores enforce that a
//! committed offset never moves backwards; a regression means two consumers are committing for
//! the same key and is reported as [Error::StaleCommit].
//!
//! [Error::StaleCommit]: crate::Error::StaleCommit

use async_trait::async_trait;

use crate::Result;
use crate::message::{Offset, StreamKey};

/// Process local store, useful for embedding and tests.
pub mod memory;

/// Store that keeps one JSON document per key on the local file system.
pub mod file;

pub use file::FileOffsetStore;
pub use memory::MemoryOffsetStore;

/// OffsetStore persists consumption progress per [StreamKey].
///
/// This trait is object-safe and is used as `Arc<dyn OffsetStore>` by the engine.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Returns the last committed offset, `None` if nothing was ever committed for the key.
    async fn get(&self, key: &StreamKey) -> Result<Option<Offset>>;

    /// Durably records `offset` as the last flushed offset for `key`.
    ///
    /// Committing the currently stored offset again succeeds. Committing an offset lower than the
    /// stored one fails with [crate::Error::StaleCommit].
    async fn commit(&self, key: &StreamKey, offset: Offset) -> Result<()>;

    /// Name of the store, used in logs.
    fn name(&self) -> &str;
}

/// Shared monotonicity check used by every store before it writes.
pub(crate) fn check_monotonic(
    key: &StreamKey,
    stored: Option<Offset>,
    attempted: Offset,
) -> Result<()> {
    match stored {
        Some(stored) if attempted < stored => Err(crate::Error::StaleCommit {
            key: key.clone(),
            stored,
            attempted,
        }),
        _ => Ok(()),
    }
}
