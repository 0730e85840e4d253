use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::progress::SharedProgress;
use crate::config::StreamConfig;
use crate::message::{Offset, StreamKey};
use crate::metrics::StreamRecorder;
use crate::offset_store::OffsetStore;
use crate::processor::Processor;
use crate::retry::retry_with_backoff;
use crate::{Error, Result};

/// The flush ticker. Flushes the processor on every tick and commits the high-water offset the
/// flush covered. Sole writer of the committed offset.
pub(super) struct Flusher<M, P> {
    pub(super) key: StreamKey,
    pub(super) config: StreamConfig,
    pub(super) store: Arc<dyn OffsetStore>,
    pub(super) processor: Arc<Mutex<P>>,
    pub(super) progress: SharedProgress,
    pub(super) recorder: StreamRecorder,
    pub(super) abort: CancellationToken,
    /// Fires once the consumption loop has returned.
    pub(super) loop_done: CancellationToken,
    pub(super) consecutive_failures: u32,
    pub(super) _message: PhantomData<fn(M)>,
}

impl<M, P> Flusher<M, P>
where
    M: Send + 'static,
    P: Processor<M>,
{
    /// Ticks until the consumption loop is done, then performs the final flush unless the run
    /// was aborted. Fatal errors cancel the abort token before they are returned.
    pub(super) async fn run(mut self) -> Result<()> {
        let interval = self.config.flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;
                _ = self.abort.cancelled() => break Ok(()),
                _ = self.loop_done.cancelled() => break self.final_flush().await,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_cycle().await {
                        break Err(e);
                    }
                }
            }
        };

        if let Err(e) = &result {
            error!(error = %e, "Flush routine failed");
            self.abort.cancel();
        }
        result
    }

    async fn flush_cycle(&mut self) -> Result<()> {
        let (high_water, result) = self.flush().await;
        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.commit(high_water).await
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                warn!(
                    error = %e,
                    consecutive_failures = self.consecutive_failures,
                    "Flush failed, skipping commit"
                );
                if self.consecutive_failures > self.config.max_flush_failures {
                    return Err(Error::FlushThresholdExceeded(self.consecutive_failures));
                }
                Ok(())
            }
        }
    }

    async fn final_flush(&mut self) -> Result<()> {
        let (high_water, result) = self.flush().await;
        match result {
            Ok(()) => {
                self.commit(high_water).await?;
                info!(committed = ?high_water, "Final flush completed");
            }
            // records after the last commit are delivered again on the next run
            Err(e) => warn!(error = %e, "Final flush failed, offsets stay at the last commit"),
        }
        Ok(())
    }

    /// Snapshots the high-water offset and flushes while holding the processor, so the
    /// snapshot describes exactly what the flush made durable.
    async fn flush(&self) -> (Option<Offset>, Result<()>) {
        let mut processor = self.processor.lock().await;
        let high_water = self.progress.lock().high_water();
        let result = processor
            .flush()
            .await
            .map_err(|e| Error::Flush(e.to_string()));
        match &result {
            Ok(()) => self.recorder.flushed(),
            Err(_) => self.recorder.flush_error(),
        }
        (high_water, result)
    }

    async fn commit(&self, high_water: Option<Offset>) -> Result<()> {
        let Some(offset) = high_water else {
            debug!("Nothing processed yet, skipping commit");
            return Ok(());
        };

        let committed = retry_with_backoff(
            self.config.store_retry.backoff(),
            &self.abort,
            "offset commit",
            || self.store.commit(&self.key, offset),
        )
        .await?;

        if committed.is_some() {
            self.progress.lock().commit(offset);
            self.recorder.committed(offset);
            debug!(offset, "Committed offset");
        }
        Ok(())
    }
}
