use std::sync::Arc;

use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tributary_core::metrics::start_metrics_server;
use tributary_core::{
    Coordinator, DecoderRegistry, EngineFailure, FileLog, FileOffsetStore, MemoryOffsetStore,
    OffsetStore, PartitionReader, ProtoDecoder, RunSummary, StaticCoordinator, StreamEngine,
    StreamKey,
};

use crate::cmdline::Settings;
use crate::counter::{Counter, CounterProcessor};

mod cmdline;
mod counter;
mod setup_tracing;

#[derive(Error, Debug)]
enum RunError {
    #[error(transparent)]
    Setup(#[from] tributary_core::Error),

    #[error("Stream Failed - {0}")]
    Stream(#[from] EngineFailure),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_tracing::register();

    let matches = cmdline::root_cli().get_matches();
    let settings = Settings::try_from(&matches)
        .inspect_err(|e| error!(error = %e, "Invalid settings"))?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    if let Err(e) = run(settings, shutdown).await {
        match &e {
            RunError::Stream(failure) => error!(
                kind = failure.error.kind(),
                error = %failure.error,
                committed = ?failure.committed,
                high_water = ?failure.high_water,
                "Stream failed"
            ),
            RunError::Setup(e) => error!(kind = e.kind(), error = %e, "Stream setup failed"),
        }
        return Err(e.into());
    }
    info!("Exiting...");
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(error = %e, "Failed to install terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Consumes the configured partition until `shutdown` fires or the stream fails.
async fn run(settings: Settings, shutdown: CancellationToken) -> Result<RunSummary, RunError> {
    let topology = StaticCoordinator::new()
        .connect(&settings.coordinator)
        .await?;
    info!(brokers = ?topology.brokers, "Resolved topology");

    let key = StreamKey::new(
        settings.topic.as_str(),
        settings.partition,
        settings.client_id.as_str(),
    )?;
    let reader: Arc<dyn PartitionReader> =
        Arc::new(FileLog::new(settings.log_dir.clone()).with_poll_timeout(settings.poll_timeout));
    let store: Arc<dyn OffsetStore> = match &settings.offset_dir {
        Some(dir) => Arc::new(FileOffsetStore::open(dir).await?),
        None => {
            warn!("No offset directory configured, committed offsets are lost on exit");
            Arc::new(MemoryOffsetStore::new())
        }
    };

    let mut decoders = DecoderRegistry::new();
    decoders.register(settings.topic.as_str(), ProtoDecoder::<Counter>::new());

    let metrics_cancel = CancellationToken::new();
    let metrics_server = settings
        .metrics_addr
        .map(|addr| tokio::spawn(start_metrics_server(addr, metrics_cancel.clone())));

    let handle = StreamEngine::new(
        key,
        settings.stream,
        reader,
        store,
        Arc::new(decoders),
        CounterProcessor::new(),
    )?
    .start();

    let stream_shutdown = handle.shutdown_token();
    let stop_on_signal = tokio::spawn(async move {
        shutdown.cancelled().await;
        info!("Stopping stream");
        stream_shutdown.cancel();
    });

    let outcome = handle.wait().await;
    stop_on_signal.abort();
    metrics_cancel.cancel();
    if let Some(server) = metrics_server {
        match server.await {
            Ok(Err(e)) => warn!(error = %e, "Metrics server failed"),
            Err(e) => warn!(error = %e, "Metrics server task failed"),
            Ok(Ok(())) => {}
        }
    }

    let summary = outcome?;
    info!(
        committed = ?summary.committed,
        high_water = ?summary.high_water,
        "Stream stopped"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use prost::Message;
    use tempfile::TempDir;
    use tributary_core::{Error as CoreError, RawRecord};

    use super::*;

    const TOPIC: &str = "counters";

    fn settings(dir: &Path, extra: &[&str]) -> Settings {
        let log_dir = dir.join("log").display().to_string();
        let offset_dir = dir.join("offsets").display().to_string();
        let mut args = vec![
            "tributary",
            "--coordinator",
            "127.0.0.1:2181",
            "--topic",
            TOPIC,
            "--client-id",
            "test-client",
            "--log-dir",
            log_dir.as_str(),
            "--offset-dir",
            offset_dir.as_str(),
            "--flush-interval-ms",
            "20",
            "--poll-timeout-ms",
            "10",
        ];
        args.extend_from_slice(extra);
        let matches = cmdline::root_cli().try_get_matches_from(args).unwrap();
        Settings::try_from(&matches).unwrap()
    }

    async fn committed(dir: &Path) -> Option<i64> {
        let store = FileOffsetStore::open(dir.join("offsets")).await.unwrap();
        let key = StreamKey::new(TOPIC, 0, "test-client").unwrap();
        store.get(&key).await.unwrap()
    }

    #[tokio::test]
    async fn test_run_counts_commits_and_resumes() {
        let tmp_dir = TempDir::new().unwrap();
        let log = FileLog::new(tmp_dir.path().join("log"));
        for (offset, count) in [(10, 5), (11, 7), (12, 2), (13, 1)] {
            let payload = Counter { count }.encode_to_vec();
            log.append(TOPIC, 0, &RawRecord::new(offset, payload))
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(settings(tmp_dir.path(), &[]), shutdown.clone()));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while committed(tmp_dir.path()).await != Some(13) {
            assert!(tokio::time::Instant::now() < deadline, "offset 13 never committed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.committed, Some(13));
        assert_eq!(summary.high_water, Some(13));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(settings(tmp_dir.path(), &[]), shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.committed, Some(13));
        assert_eq!(committed(tmp_dir.path()).await, Some(13));
    }

    #[tokio::test]
    async fn test_run_fails_on_undecodable_payloads() {
        let tmp_dir = TempDir::new().unwrap();
        let log = FileLog::new(tmp_dir.path().join("log"));
        log.append(TOPIC, 0, &RawRecord::new(0, vec![0x0a, 0x05, 0x01]))
            .await
            .unwrap();

        let result = run(
            settings(tmp_dir.path(), &["--max-decode-failures", "0"]),
            CancellationToken::new(),
        )
        .await;

        match result {
            Err(RunError::Stream(failure)) => {
                assert!(matches!(
                    failure.error,
                    CoreError::DecodeThresholdExceeded { offset: 0, .. }
                ));
                assert_eq!(failure.committed, None);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
