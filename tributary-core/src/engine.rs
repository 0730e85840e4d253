//! The stream engine drives one [StreamKey]: it resumes from the committed offset, delivers
//! records to the [Processor] in offset order and periodically flushes the processor and commits
//! the offset of the last processed record.
//!
//! A run goes through the following states.
//!
//! ```text
//! Initializing --> Running --> Draining --> Stopped
//!      |              |           |
//!      +--------------+-----------+-------> Failed
//! ```
//!
//! Two tasks share a run once it is `Running`, the consumption loop and the flush ticker. They
//! only communicate through the shared [Progress](progress::Progress), the processor mutex and
//! cancellation tokens. The invariant `committed <= high-water <= last delivered offset` holds at
//! all times, since the committed offset is a high-water snapshot taken under the processor lock
//! right before the flush that made it durable.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{StartOffset, StreamConfig};
use crate::decoder::DecoderRegistry;
use crate::message::{Offset, RawRecord, StreamKey, successor};
use crate::metrics::StreamRecorder;
use crate::offset_store::OffsetStore;
use crate::processor::Processor;
use crate::reader::PartitionReader;
use crate::retry::retry_with_backoff;
use crate::{Error, Result};

mod consumer;
mod flusher;
mod progress;

use consumer::Consumer;
use flusher::Flusher;
use progress::{Progress, SharedProgress};

/// Lifecycle state of a stream run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initializing,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Failed)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Initializing => "Initializing",
            EngineState::Running => "Running",
            EngineState::Draining => "Draining",
            EngineState::Stopped => "Stopped",
            EngineState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Point in time view of a stream for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatus {
    pub state: EngineState,
    pub committed: Option<Offset>,
    pub high_water: Option<Offset>,
    /// Offset held back after failing `process`, if any.
    pub stuck_offset: Option<Offset>,
    pub stuck_attempts: u32,
}

/// Outcome of a run that reached [EngineState::Stopped].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub committed: Option<Offset>,
    pub high_water: Option<Offset>,
}

/// Outcome of a run that reached [EngineState::Failed].
#[derive(Error, Debug, Clone)]
#[error("{error} (committed {committed:?}, high-water {high_water:?})")]
pub struct EngineFailure {
    pub error: Error,
    pub committed: Option<Offset>,
    pub high_water: Option<Offset>,
}

/// Moves to `to` unless the run already reached a terminal state.
fn transition(state: &watch::Sender<EngineState>, to: EngineState) {
    let changed = state.send_if_modified(|current| {
        if current.is_terminal() || *current == to {
            return false;
        }
        *current = to;
        true
    });
    if changed {
        info!(state = %to, "Stream state changed");
    }
}

/// Moves a running stream to [EngineState::Draining] as soon as a stop is requested, while the
/// consumption loop is still finishing its in-flight batch.
async fn drain_on_stop(
    state: Arc<watch::Sender<EngineState>>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    loop_done: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = loop_done.cancelled() => {}
        _ = shutdown.cancelled() => {
            // an abort cancels the shutdown token too, that run fails instead
            if !abort.is_cancelled() {
                transition(&state, EngineState::Draining);
            }
        }
    }
}

/// StreamEngine wires the collaborators of one stream run. It is consumed by [StreamEngine::start].
pub struct StreamEngine<M, P> {
    key: StreamKey,
    config: StreamConfig,
    reader: Arc<dyn PartitionReader>,
    store: Arc<dyn OffsetStore>,
    decoders: Arc<DecoderRegistry<M>>,
    processor: P,
}

impl<M, P> StreamEngine<M, P>
where
    M: Send + 'static,
    P: Processor<M>,
{
    pub fn new(
        key: StreamKey,
        config: StreamConfig,
        reader: Arc<dyn PartitionReader>,
        store: Arc<dyn OffsetStore>,
        decoders: Arc<DecoderRegistry<M>>,
        processor: P,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            key,
            config,
            reader,
            store,
            decoders,
            processor,
        })
    }

    /// Spawns the run on the current tokio runtime.
    pub fn start(self) -> StreamHandle {
        let (state_tx, state_rx) = watch::channel(EngineState::Initializing);
        let abort = CancellationToken::new();
        // a stop request only ends the consumption loop, an abort also skips the final flush.
        let shutdown = abort.child_token();
        let progress: SharedProgress = Arc::new(Mutex::new(Progress::default()));

        let span = info_span!(
            "stream",
            topic = self.key.topic(),
            partition = self.key.partition(),
            client_id = self.key.client_id(),
        );
        let run = Run {
            key: self.key.clone(),
            config: self.config,
            reader: self.reader,
            store: self.store,
            decoders: self.decoders,
            recorder: StreamRecorder::new(&self.key),
            progress: Arc::clone(&progress),
            state: Arc::new(state_tx),
            shutdown: shutdown.clone(),
            abort: abort.clone(),
        };
        let task = tokio::spawn(run.run(self.processor).instrument(span));

        StreamHandle {
            key: self.key,
            shutdown,
            abort,
            state: state_rx,
            progress,
            task,
        }
    }
}

/// Handle to a started stream.
pub struct StreamHandle {
    key: StreamKey,
    shutdown: CancellationToken,
    abort: CancellationToken,
    state: watch::Receiver<EngineState>,
    progress: SharedProgress,
    task: JoinHandle<std::result::Result<RunSummary, EngineFailure>>,
}

impl StreamHandle {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Requests a graceful stop. The in-flight batch is finished and a final flush and commit is
    /// performed before the stream reaches [EngineState::Stopped].
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Token that requests a graceful stop when cancelled, for wiring up signal handlers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Tears the run down without a final flush, as if the process had crashed. The run ends in
    /// [EngineState::Failed] and records after the last commit are delivered again next time.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    pub fn status(&self) -> StreamStatus {
        let state = self.state();
        let progress = *self.progress.lock();
        let stuck = progress.stuck();
        StreamStatus {
            state,
            committed: progress.committed(),
            high_water: progress.high_water(),
            stuck_offset: stuck.map(|stuck| stuck.offset),
            stuck_attempts: stuck.map_or(0, |stuck| stuck.attempts),
        }
    }

    /// Resolves once the run reached [EngineState::Stopped] or [EngineState::Failed].
    pub async fn wait(self) -> std::result::Result<RunSummary, EngineFailure> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let progress = *self.progress.lock();
                Err(EngineFailure {
                    error: Error::Internal(format!("stream task terminated: {e}")),
                    committed: progress.committed(),
                    high_water: progress.high_water(),
                })
            }
        }
    }
}

/// Everything a run needs besides the processor.
struct Run<M> {
    key: StreamKey,
    config: StreamConfig,
    reader: Arc<dyn PartitionReader>,
    store: Arc<dyn OffsetStore>,
    decoders: Arc<DecoderRegistry<M>>,
    recorder: StreamRecorder,
    progress: SharedProgress,
    state: Arc<watch::Sender<EngineState>>,
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl<M> Run<M>
where
    M: Send + 'static,
{
    async fn run<P: Processor<M>>(
        self,
        processor: P,
    ) -> std::result::Result<RunSummary, EngineFailure> {
        let outcome = match self.initialize().await {
            Ok(Some((next, batch))) => {
                transition(&self.state, EngineState::Running);
                self.consume(processor, next, batch).await
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        let progress = *self.progress.lock();
        match outcome {
            Ok(()) => {
                transition(&self.state, EngineState::Stopped);
                info!(
                    committed = ?progress.committed(),
                    high_water = ?progress.high_water(),
                    "Stream stopped"
                );
                Ok(RunSummary {
                    committed: progress.committed(),
                    high_water: progress.high_water(),
                })
            }
            Err(e) => {
                transition(&self.state, EngineState::Failed);
                error!(
                    error = %e,
                    kind = e.kind(),
                    committed = ?progress.committed(),
                    high_water = ?progress.high_water(),
                    "Stream failed"
                );
                Err(EngineFailure {
                    error: e,
                    committed: progress.committed(),
                    high_water: progress.high_water(),
                })
            }
        }
    }

    /// Resolves the resume offset and performs the first fetch. `None` when stopped meanwhile.
    async fn initialize(&self) -> Result<Option<(Offset, Vec<RawRecord>)>> {
        if !self.decoders.contains(self.key.topic()) {
            return Err(Error::UnregisteredTopic(self.key.topic().to_string()));
        }

        let Some(committed) = retry_with_backoff(
            self.config.store_retry.backoff(),
            &self.shutdown,
            "offset store get",
            || self.store.get(&self.key),
        )
        .await?
        else {
            return self.stopped_during_init();
        };

        let next = match (committed, self.config.start_offset) {
            (Some(committed), _) => successor(committed)?,
            (None, StartOffset::At(offset)) => offset,
            (None, StartOffset::Earliest) => {
                let Some(earliest) = retry_with_backoff(
                    self.config.fetch_retry.backoff(),
                    &self.shutdown,
                    "earliest offset lookup",
                    || {
                        self.reader
                            .earliest_offset(self.key.topic(), self.key.partition())
                    },
                )
                .await?
                else {
                    return self.stopped_during_init();
                };
                earliest
            }
        };

        *self.progress.lock() = Progress::resumed(committed);
        self.recorder.resumed(committed);
        info!(
            committed = ?committed,
            next_offset = next,
            store = self.store.name(),
            "Resuming stream"
        );

        let Some(batch) = retry_with_backoff(
            self.config.fetch_retry.backoff(),
            &self.shutdown,
            "partition fetch",
            || {
                self.reader.fetch(
                    self.key.topic(),
                    self.key.partition(),
                    next,
                    self.config.max_batch,
                )
            },
        )
        .await?
        else {
            return self.stopped_during_init();
        };
        self.recorder.read(batch.len());

        Ok(Some((next, batch)))
    }

    fn stopped_during_init(&self) -> Result<Option<(Offset, Vec<RawRecord>)>> {
        if self.abort.is_cancelled() {
            return Err(Error::Internal("stream aborted".to_string()));
        }
        info!("Stop requested while initializing");
        Ok(None)
    }

    /// Runs the consumption loop and the flush ticker until both are done.
    async fn consume<P: Processor<M>>(
        &self,
        processor: P,
        next: Offset,
        batch: Vec<RawRecord>,
    ) -> Result<()> {
        let processor = Arc::new(tokio::sync::Mutex::new(processor));
        let loop_done = CancellationToken::new();

        let consumer = Consumer {
            key: self.key.clone(),
            config: self.config.clone(),
            reader: Arc::clone(&self.reader),
            decoders: Arc::clone(&self.decoders),
            processor: Arc::clone(&processor),
            progress: Arc::clone(&self.progress),
            recorder: self.recorder.clone(),
            state: Arc::clone(&self.state),
            shutdown: self.shutdown.clone(),
            abort: self.abort.clone(),
            next,
            decode_failures: 0,
            process_backoff: self.config.process_retry.backoff(),
        };
        let flusher = Flusher {
            key: self.key.clone(),
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            processor,
            progress: Arc::clone(&self.progress),
            recorder: self.recorder.clone(),
            abort: self.abort.clone(),
            loop_done: loop_done.clone(),
            consecutive_failures: 0,
            _message: PhantomData,
        };

        let consumer_task = tokio::spawn(consumer.run(batch).in_current_span());
        let flusher_task = tokio::spawn(flusher.run().in_current_span());
        let drain_task = tokio::spawn(
            drain_on_stop(
                Arc::clone(&self.state),
                self.shutdown.clone(),
                self.abort.clone(),
                loop_done.clone(),
            )
            .in_current_span(),
        );

        let consumer_result = consumer_task
            .await
            .unwrap_or_else(|e| Err(Error::Internal(format!("consumption task failed: {e}"))));
        if consumer_result.is_err() {
            self.abort.cancel();
        }
        loop_done.cancel();
        if let Err(e) = drain_task.await {
            warn!(error = %e, "Drain watcher failed");
        }

        let flusher_result = flusher_task
            .await
            .unwrap_or_else(|e| Err(Error::Internal(format!("flush task failed: {e}"))));

        consumer_result?;
        flusher_result?;
        if self.abort.is_cancelled() {
            return Err(Error::Internal(
                "stream aborted without a final flush".to_string(),
            ));
        }
        Ok(())
    }
}
