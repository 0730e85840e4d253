use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::EngineState;
use super::progress::SharedProgress;
use crate::config::{PoisonPolicy, StreamConfig};
use crate::decoder::DecoderRegistry;
use crate::message::{Offset, RawRecord, StreamKey, successor};
use crate::metrics::StreamRecorder;
use crate::processor::Processor;
use crate::reader::PartitionReader;
use crate::retry::{Exponential, retry_with_backoff};
use crate::{Error, Result};

/// Whether the loop keeps fetching after a batch.
enum Step {
    Continue,
    Stop,
}

/// The consumption loop. Sole writer of the high-water offset.
pub(super) struct Consumer<M, P> {
    pub(super) key: StreamKey,
    pub(super) config: StreamConfig,
    pub(super) reader: Arc<dyn PartitionReader>,
    pub(super) decoders: Arc<DecoderRegistry<M>>,
    pub(super) processor: Arc<Mutex<P>>,
    pub(super) progress: SharedProgress,
    pub(super) recorder: StreamRecorder,
    pub(super) state: Arc<watch::Sender<EngineState>>,
    /// Fires on a requested stop and on abort.
    pub(super) shutdown: CancellationToken,
    pub(super) abort: CancellationToken,
    /// Next offset to deliver. Everything below it was processed or given up on.
    pub(super) next: Offset,
    pub(super) decode_failures: u32,
    pub(super) process_backoff: Exponential,
}

impl<M, P> Consumer<M, P>
where
    M: Send + 'static,
    P: Processor<M>,
{
    /// Consumes `batch` and everything fetched after it until stopped. Fatal errors cancel the
    /// abort token before they are returned.
    pub(super) async fn run(mut self, batch: Vec<RawRecord>) -> Result<()> {
        let result = self.consume_all(batch).await;
        if let Err(e) = &result {
            error!(error = %e, next_offset = self.next, "Consumption loop failed");
            self.abort.cancel();
        }
        result
    }

    async fn consume_all(&mut self, mut batch: Vec<RawRecord>) -> Result<()> {
        loop {
            if let Step::Stop = self.consume(batch).await? {
                break;
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            batch = match self.fetch().await? {
                Some(batch) => batch,
                None => break,
            };
        }

        if !self.abort.is_cancelled() {
            super::transition(&self.state, EngineState::Draining);
            info!(next_offset = self.next, "Consumption loop drained");
        }
        Ok(())
    }

    /// Fetches the next batch, `None` once the stream is stopping.
    async fn fetch(&self) -> Result<Option<Vec<RawRecord>>> {
        let batch = retry_with_backoff(
            self.config.fetch_retry.backoff(),
            &self.shutdown,
            "partition fetch",
            || {
                self.reader.fetch(
                    self.key.topic(),
                    self.key.partition(),
                    self.next,
                    self.config.max_batch,
                )
            },
        )
        .await?;

        if let Some(batch) = &batch {
            debug!(from = self.next, count = batch.len(), "Fetched batch");
            self.recorder.read(batch.len());
        }
        Ok(batch)
    }

    async fn consume(&mut self, batch: Vec<RawRecord>) -> Result<Step> {
        for record in batch {
            if self.abort.is_cancelled() {
                return Ok(Step::Stop);
            }
            if record.offset < self.next {
                warn!(
                    offset = record.offset,
                    next_offset = self.next,
                    "Dropping record below the next expected offset"
                );
                continue;
            }

            let message = match self.decoders.decode(self.key.topic(), &record.payload) {
                Ok(message) => {
                    self.decode_failures = 0;
                    message
                }
                Err(e) => {
                    self.on_decode_failure(record.offset, e)?;
                    continue;
                }
            };

            let offset = record.offset;
            let result = {
                let mut processor = self.processor.lock().await;
                let result = processor.process(offset, message).await;
                if result.is_ok() {
                    let recovered = self.progress.lock().advance(offset);
                    if recovered {
                        info!(offset, "Held back record processed");
                        self.recorder.unstuck();
                        self.process_backoff.reset();
                    }
                }
                result
            };

            match result {
                Ok(()) => {
                    self.recorder.processed(offset);
                    self.next = successor(offset)?;
                }
                Err(e) => return self.on_process_failure(offset, e.to_string()).await,
            }
        }
        Ok(Step::Continue)
    }

    fn on_decode_failure(&mut self, offset: Offset, e: Error) -> Result<()> {
        self.decode_failures = self.decode_failures.saturating_add(1);
        self.recorder.decode_error();
        warn!(
            offset,
            error = %e,
            consecutive_failures = self.decode_failures,
            "Skipping record that failed to decode"
        );
        if self.decode_failures > self.config.max_decode_failures {
            return Err(Error::DecodeThresholdExceeded {
                failures: self.decode_failures,
                offset,
                reason: e.to_string(),
            });
        }
        self.next = successor(offset)?;
        Ok(())
    }

    /// Holds the record back and backs off, the rest of the batch is discarded and fetched
    /// again starting at the failed offset.
    async fn on_process_failure(&mut self, offset: Offset, reason: String) -> Result<Step> {
        let attempts = self.progress.lock().fail(offset);
        self.recorder.process_error(offset);
        warn!(
            stuck_offset = offset,
            attempt = attempts,
            error = %reason,
            "Process failed, holding back offset"
        );

        if let Some(max_attempts) = self.config.max_process_attempts
            && attempts >= max_attempts
        {
            match self.config.poison_policy {
                PoisonPolicy::Fail => {
                    return Err(Error::Process {
                        offset,
                        attempts,
                        reason,
                    });
                }
                PoisonPolicy::Skip => {
                    error!(
                        offset,
                        attempts,
                        error = %reason,
                        "Skipping poison record"
                    );
                    self.progress.lock().skip();
                    self.recorder.unstuck();
                    self.process_backoff.reset();
                    self.next = successor(offset)?;
                    return Ok(Step::Continue);
                }
            }
        }

        let delay = self
            .process_backoff
            .next()
            .unwrap_or(self.config.process_retry.max_interval);
        self.next = offset;
        if self.sleep(delay).await {
            Ok(Step::Continue)
        } else {
            Ok(Step::Stop)
        }
    }

    /// Sleeps unless the stream stops first, returns false when it did.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
