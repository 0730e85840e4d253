//! Prometheus metrics of every stream in the process, exposed in the OpenMetrics text format.
//!
//! All streams share one global registry. Each metric is a family labelled with the stream's
//! `topic`, `partition` and `client_id`.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::Router;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::message::{Offset, StreamKey};
use crate::{Error, Result};

const REGISTRY_PREFIX: &str = "tributary";

// counters, the `_total` suffix is added by the client library
const READ_TOTAL: &str = "read";
const PROCESSED_TOTAL: &str = "processed";
const PROCESS_ERRORS_TOTAL: &str = "process_errors";
const DECODE_ERRORS_TOTAL: &str = "decode_errors";
const FLUSH_TOTAL: &str = "flush";
const FLUSH_ERRORS_TOTAL: &str = "flush_errors";
const COMMIT_TOTAL: &str = "commit";

// gauges
const COMMITTED_OFFSET: &str = "committed_offset";
const HIGH_WATER_OFFSET: &str = "high_water_offset";
const STUCK_OFFSET: &str = "stuck_offset";

/// Value of the stuck offset gauge while no record is held back.
const NOT_STUCK: i64 = -1;

type Labels = Vec<(String, String)>;

/// The global register of all metrics.
struct GlobalRegistry {
    // registration happens once per metric, a blocking mutex is fine.
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_PREFIX)),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// StreamMetrics holds the metric families updated by the stream engine.
pub(crate) struct StreamMetrics {
    pub(crate) read_total: Family<Labels, Counter>,
    pub(crate) processed_total: Family<Labels, Counter>,
    pub(crate) process_errors_total: Family<Labels, Counter>,
    pub(crate) decode_errors_total: Family<Labels, Counter>,
    pub(crate) flush_total: Family<Labels, Counter>,
    pub(crate) flush_errors_total: Family<Labels, Counter>,
    pub(crate) commit_total: Family<Labels, Counter>,
    pub(crate) committed_offset: Family<Labels, Gauge>,
    pub(crate) high_water_offset: Family<Labels, Gauge>,
    pub(crate) stuck_offset: Family<Labels, Gauge>,
}

impl StreamMetrics {
    fn new() -> Self {
        let metrics = Self {
            read_total: Family::default(),
            processed_total: Family::default(),
            process_errors_total: Family::default(),
            decode_errors_total: Family::default(),
            flush_total: Family::default(),
            flush_errors_total: Family::default(),
            commit_total: Family::default(),
            committed_offset: Family::default(),
            high_water_offset: Family::default(),
            stuck_offset: Family::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            READ_TOTAL,
            "Total number of records fetched from the partition",
            metrics.read_total.clone(),
        );
        registry.register(
            PROCESSED_TOTAL,
            "Total number of records successfully processed",
            metrics.processed_total.clone(),
        );
        registry.register(
            PROCESS_ERRORS_TOTAL,
            "Total number of failed process calls",
            metrics.process_errors_total.clone(),
        );
        registry.register(
            DECODE_ERRORS_TOTAL,
            "Total number of records that could not be decoded",
            metrics.decode_errors_total.clone(),
        );
        registry.register(
            FLUSH_TOTAL,
            "Total number of successful processor flushes",
            metrics.flush_total.clone(),
        );
        registry.register(
            FLUSH_ERRORS_TOTAL,
            "Total number of failed processor flushes",
            metrics.flush_errors_total.clone(),
        );
        registry.register(
            COMMIT_TOTAL,
            "Total number of offsets committed to the offset store",
            metrics.commit_total.clone(),
        );
        registry.register(
            COMMITTED_OFFSET,
            "Last offset committed to the offset store",
            metrics.committed_offset.clone(),
        );
        registry.register(
            HIGH_WATER_OFFSET,
            "Greatest offset processed since the stream started",
            metrics.high_water_offset.clone(),
        );
        registry.register(
            STUCK_OFFSET,
            "Offset currently held back after failing process, -1 when none",
            metrics.stuck_offset.clone(),
        );
        metrics
    }
}

static STREAM_METRICS: OnceLock<StreamMetrics> = OnceLock::new();

pub(crate) fn stream_metrics() -> &'static StreamMetrics {
    STREAM_METRICS.get_or_init(StreamMetrics::new)
}

/// Per-stream view on [StreamMetrics] with the label set resolved once.
#[derive(Clone)]
pub(crate) struct StreamRecorder {
    labels: Labels,
}

impl StreamRecorder {
    pub(crate) fn new(key: &StreamKey) -> Self {
        Self {
            labels: key.metric_labels(),
        }
    }

    pub(crate) fn read(&self, count: usize) {
        stream_metrics()
            .read_total
            .get_or_create(&self.labels)
            .inc_by(count as u64);
    }

    pub(crate) fn processed(&self, offset: Offset) {
        let metrics = stream_metrics();
        metrics.processed_total.get_or_create(&self.labels).inc();
        metrics
            .high_water_offset
            .get_or_create(&self.labels)
            .set(offset);
    }

    pub(crate) fn process_error(&self, stuck: Offset) {
        let metrics = stream_metrics();
        metrics.process_errors_total.get_or_create(&self.labels).inc();
        metrics.stuck_offset.get_or_create(&self.labels).set(stuck);
    }

    pub(crate) fn unstuck(&self) {
        stream_metrics()
            .stuck_offset
            .get_or_create(&self.labels)
            .set(NOT_STUCK);
    }

    pub(crate) fn decode_error(&self) {
        stream_metrics()
            .decode_errors_total
            .get_or_create(&self.labels)
            .inc();
    }

    pub(crate) fn flushed(&self) {
        stream_metrics().flush_total.get_or_create(&self.labels).inc();
    }

    pub(crate) fn flush_error(&self) {
        stream_metrics()
            .flush_errors_total
            .get_or_create(&self.labels)
            .inc();
    }

    pub(crate) fn committed(&self, offset: Offset) {
        let metrics = stream_metrics();
        metrics.commit_total.get_or_create(&self.labels).inc();
        metrics
            .committed_offset
            .get_or_create(&self.labels)
            .set(offset);
    }

    /// Publishes the offsets a stream resumed from.
    pub(crate) fn resumed(&self, committed: Option<Offset>) {
        let metrics = stream_metrics();
        if let Some(committed) = committed {
            metrics
                .committed_offset
                .get_or_create(&self.labels)
                .set(committed);
            metrics
                .high_water_offset
                .get_or_create(&self.labels)
                .set(committed);
        }
        metrics
            .stuck_offset
            .get_or_create(&self.labels)
            .set(NOT_STUCK);
    }
}

/// Encodes the global registry in the OpenMetrics text format.
pub async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = String::new();
    {
        let registry = global_registry().registry.lock();
        if let Err(e) = encode(&mut buffer, &registry) {
            error!(error = %e, "Failed to encode metrics");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    debug!("Exposing metrics: {:?}", buffer);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Router for the metrics and liveness endpoints.
pub fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

/// Serves [metrics_router] on `addr` until `cancel` fires.
pub async fn start_metrics_server(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics listener on {addr}: {e}")))?;
    info!(?addr, "Started metrics server");

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Metrics(format!("Serving metrics: {e}")))
}
