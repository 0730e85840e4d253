//! Fault injecting doubles for the engine's collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::decoder::DecoderRegistry;
use crate::message::{Offset, RawRecord, StreamKey};
use crate::offset_store::{MemoryOffsetStore, OffsetStore};
use crate::processor::Processor;
use crate::reader::{MemoryLog, PartitionReader};
use crate::{BoxError, Error, Result};

/// Decrements `counter` if it is positive and reports whether it was.
fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
        .is_ok()
}

/// [PartitionReader] over a [MemoryLog] that can fail, slow down or replay fetches.
#[derive(Debug)]
pub(crate) struct FaultyReader {
    pub(crate) log: Arc<MemoryLog>,
    fail_next_fetches: AtomicUsize,
    /// The next fetch starts this many offsets before the requested one.
    replay_next: AtomicUsize,
    fetch_latency_ms: AtomicU64,
    fetches: AtomicUsize,
}

impl FaultyReader {
    pub(crate) fn new(log: Arc<MemoryLog>) -> Self {
        Self {
            log,
            fail_next_fetches: AtomicUsize::new(0),
            replay_next: AtomicUsize::new(0),
            fetch_latency_ms: AtomicU64::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_fetches(&self, count: usize) {
        self.fail_next_fetches.store(count, Ordering::Relaxed);
    }

    /// Makes the next fetch return `count` already delivered records in front of the batch.
    pub(crate) fn replay(&self, count: usize) {
        self.replay_next.store(count, Ordering::Relaxed);
    }

    pub(crate) fn set_fetch_latency(&self, ms: u64) {
        self.fetch_latency_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PartitionReader for FaultyReader {
    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        from: Offset,
        max_batch: usize,
    ) -> Result<Vec<RawRecord>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let latency = self.fetch_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if take(&self.fail_next_fetches) {
            return Err(Error::PartitionUnavailable("injected fetch failure".to_string()));
        }

        let replay = self.replay_next.swap(0, Ordering::Relaxed);
        let from = (from - replay as Offset).max(0);
        self.log.fetch(topic, partition, from, max_batch).await
    }

    async fn earliest_offset(&self, topic: &str, partition: u32) -> Result<Offset> {
        self.log.earliest_offset(topic, partition).await
    }
}

/// [OffsetStore] over a [MemoryOffsetStore] that can fail operations and records every
/// successful commit.
#[derive(Debug, Default)]
pub(crate) struct FaultyStore {
    inner: MemoryOffsetStore,
    fail_next_gets: AtomicUsize,
    fail_next_commits: AtomicUsize,
    commits: Mutex<Vec<Offset>>,
}

impl FaultyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_offset(key: StreamKey, offset: Offset) -> Self {
        Self {
            inner: MemoryOffsetStore::new().with_offset(key, offset),
            ..Default::default()
        }
    }

    pub(crate) fn fail_gets(&self, count: usize) {
        self.fail_next_gets.store(count, Ordering::Relaxed);
    }

    pub(crate) fn fail_commits(&self, count: usize) {
        self.fail_next_commits.store(count, Ordering::Relaxed);
    }

    /// Successful commits in the order they happened.
    pub(crate) fn commits(&self) -> Vec<Offset> {
        self.commits.lock().clone()
    }
}

#[async_trait]
impl OffsetStore for FaultyStore {
    async fn get(&self, key: &StreamKey) -> Result<Option<Offset>> {
        if take(&self.fail_next_gets) {
            return Err(Error::StoreUnavailable("injected get failure".to_string()));
        }
        self.inner.get(key).await
    }

    async fn commit(&self, key: &StreamKey, offset: Offset) -> Result<()> {
        if take(&self.fail_next_commits) {
            return Err(Error::StoreUnavailable(
                "injected commit failure".to_string(),
            ));
        }
        self.inner.commit(key, offset).await?;
        self.commits.lock().push(offset);
        Ok(())
    }

    fn name(&self) -> &str {
        "faulty"
    }
}

/// What a [RecordingProcessor] observed, shared with the test.
#[derive(Debug, Default)]
pub(crate) struct Recorded {
    /// Offsets of successful `process` calls.
    pub(crate) processed: Vec<Offset>,
    /// Every offset `process` was called with, failures included.
    pub(crate) attempted: Vec<Offset>,
    pub(crate) total: i64,
    /// Running total observed by each successful flush.
    pub(crate) flushed: Vec<i64>,
    pub(crate) failed_flushes: usize,
}

/// Processor that sums integer payloads and fails on demand.
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingProcessor {
    pub(crate) recorded: Arc<Mutex<Recorded>>,
    /// Remaining injected failures per offset.
    fail_offsets: Arc<Mutex<HashMap<Offset, usize>>>,
    fail_next_flushes: Arc<AtomicUsize>,
    process_latency: Arc<Mutex<Duration>>,
}

impl RecordingProcessor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fails `process` for `offset` the next `times` attempts.
    pub(crate) fn fail_offset(&self, offset: Offset, times: usize) {
        self.fail_offsets.lock().insert(offset, times);
    }

    pub(crate) fn fail_flushes(&self, count: usize) {
        self.fail_next_flushes.store(count, Ordering::Relaxed);
    }

    /// Delays every `process` call by `latency`.
    pub(crate) fn set_process_latency(&self, latency: Duration) {
        *self.process_latency.lock() = latency;
    }

    pub(crate) fn processed(&self) -> Vec<Offset> {
        self.recorded.lock().processed.clone()
    }

    pub(crate) fn total(&self) -> i64 {
        self.recorded.lock().total
    }
}

#[async_trait]
impl Processor<i64> for RecordingProcessor {
    async fn process(&mut self, offset: Offset, message: i64) -> std::result::Result<(), BoxError> {
        self.recorded.lock().attempted.push(offset);
        let latency = *self.process_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let fail = match self.fail_offsets.lock().get_mut(&offset) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if fail {
            return Err(format!("injected process failure at {offset}").into());
        }

        let mut recorded = self.recorded.lock();
        recorded.processed.push(offset);
        recorded.total += message;
        Ok(())
    }

    async fn flush(&mut self) -> std::result::Result<(), BoxError> {
        if take(&self.fail_next_flushes) {
            self.recorded.lock().failed_flushes += 1;
            return Err("injected flush failure".into());
        }
        let mut recorded = self.recorded.lock();
        let total = recorded.total;
        recorded.flushed.push(total);
        Ok(())
    }
}

/// Registry decoding UTF-8 integers for `topic`.
pub(crate) fn int_registry(topic: &str) -> Arc<DecoderRegistry<i64>> {
    let mut registry = DecoderRegistry::new();
    registry.register(topic, |payload: &[u8]| {
        std::str::from_utf8(payload)
            .map_err(|e| e.to_string())
            .and_then(|s| s.trim().parse::<i64>().map_err(|e| e.to_string()))
    });
    Arc::new(registry)
}

/// Polls `condition` until it holds, panicking after `timeout`.
pub(crate) async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
