//! Collector and pipeline metrics
//!
//! Metrics are recorded through the `metrics` facade at all times; they only
//! leave the process when [`init_metrics`] installs the Prometheus exporter.
//! Without an installed recorder every call below is a no-op.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Correlation ID generator for request tracing
static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Install the Prometheus exporter and describe every metric.
///
/// Idempotent: later calls return `Ok(())` without rebinding.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "collector_http_requests_total",
        Unit::Count,
        "HTTP requests issued by collectors, by table and status"
    );
    describe_histogram!(
        "collector_http_request_duration_seconds",
        Unit::Seconds,
        "Upstream request latency"
    );
    describe_counter!(
        "collector_http_retries_total",
        Unit::Count,
        "Retry attempts after retryable failures"
    );
    describe_histogram!(
        "collector_retry_backoff_seconds",
        Unit::Seconds,
        "Backoff slept before a retry"
    );
    describe_counter!(
        "collector_pages_persisted_total",
        Unit::Count,
        "Raw pages written to the raw store"
    );
    describe_counter!(
        "collector_items_skipped_total",
        Unit::Count,
        "Input items skipped by failure isolation, by kind"
    );
    describe_counter!(
        "pipeline_stages_total",
        Unit::Count,
        "Stage executions by final status"
    );

    *initialized = true;
    info!(%addr, "Metrics exporter listening");
    Ok(())
}

/// Whether [`init_metrics`] has installed the exporter
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Generate a new correlation ID for request tracing
pub fn generate_correlation_id() -> String {
    let id = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("req-{id:08x}")
}

/// Timing and labelling for one upstream request.
pub struct HttpRequestMetrics {
    table: String,
    start_time: Instant,
    correlation_id: String,
}

impl HttpRequestMetrics {
    /// Start timing a request against `table`'s endpoint.
    pub fn start(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            start_time: Instant::now(),
            correlation_id: generate_correlation_id(),
        }
    }

    /// Record a request that produced an HTTP status.
    pub fn record_complete(&self, status_code: u16) {
        self.record(status_code.to_string());
    }

    /// Record a request that failed before any status arrived.
    pub fn record_transport_error(&self) {
        self.record("transport_error".to_string());
    }

    fn record(&self, status: String) {
        let duration = self.start_time.elapsed();
        counter!(
            "collector_http_requests_total",
            "table" => self.table.clone(),
            "status" => status.clone(),
        )
        .increment(1);
        histogram!(
            "collector_http_request_duration_seconds",
            "table" => self.table.clone(),
        )
        .record(duration.as_secs_f64());

        debug!(
            correlation_id = %self.correlation_id,
            table = %self.table,
            status = %status,
            duration_ms = duration.as_millis() as u64,
            "HTTP request completed"
        );
    }

    /// Correlation ID attached to this request's log lines
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Record one retry and the backoff preceding it.
pub fn record_retry_backoff(table: &str, delay: Duration) {
    counter!("collector_http_retries_total", "table" => table.to_string()).increment(1);
    histogram!("collector_retry_backoff_seconds", "table" => table.to_string())
        .record(delay.as_secs_f64());
}

/// Record a raw page written to the store.
pub fn record_page_persisted(table: &str) {
    counter!("collector_pages_persisted_total", "table" => table.to_string()).increment(1);
}

/// Record an input item excluded by failure isolation.
pub fn record_item_skipped(table: &str, kind: &'static str) {
    counter!(
        "collector_items_skipped_total",
        "table" => table.to_string(),
        "kind" => kind,
    )
    .increment(1);
}

/// Record the final status of one stage.
pub fn record_stage(stage: &str, status: &'static str) {
    counter!(
        "pipeline_stages_total",
        "stage" => stage.to_string(),
        "status" => status,
    )
    .increment(1);
}
