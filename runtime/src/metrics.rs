//! Prometheus metrics for the allocation engine.
//!
//! - Allocation decisions and batch sizes
//! - Ledger commit latency
//! - Queue depth per SKU
//! - Releases per expiry trigger
//! - Circuit breaker and retry activity
//!
//! # Example
//!
//! ```rust,no_run
//! use flashsale_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and serves `/metrics` on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register descriptions, install the exporter and start serving.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.15, 0.25, 0.5, 1.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .set_buckets_for_metric(
                Matcher::Full("flashsale_batch_size".to_string()),
                &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        // A second server in the same process (tests) keeps the first recorder
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });
        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics server started");
        Ok(())
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "flashsale_requests_total",
        "Allocation requests decided, by outcome"
    );
    describe_histogram!("flashsale_batch_size", "Requests per allocation batch");
    describe_histogram!(
        "flashsale_batch_commit_duration_seconds",
        "Time taken to commit one allocation batch"
    );
    describe_gauge!(
        "flashsale_queue_depth",
        "Unacknowledged requests per SKU queue"
    );
    describe_counter!(
        "flashsale_rejected_total",
        "Submissions rejected before queueing, by reason"
    );
    describe_counter!(
        "flashsale_released_total",
        "Reservations released back to stock, by trigger"
    );
    describe_counter!(
        "flashsale_confirmed_total",
        "Reservations confirmed by checkout"
    );
    describe_counter!(
        "flashsale_events_published_total",
        "Reservation events published"
    );
    describe_counter!(
        "flashsale_event_publish_errors_total",
        "Reservation events that failed to publish"
    );
    describe_counter!(
        "flashsale_worker_restarts_total",
        "SKU workers restarted by the supervisor"
    );
    describe_gauge!(
        "flashsale_circuit_breaker_state",
        "Circuit breaker state per SKU (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "flashsale_circuit_breaker_state_change",
        "Circuit breaker state transitions"
    );
    describe_counter!(
        "flashsale_circuit_breaker_rejections_total",
        "Calls rejected by an open circuit"
    );
    describe_counter!("flashsale_retry_attempts_total", "Retries performed");
    describe_counter!(
        "flashsale_retry_exhausted_total",
        "Operations that exhausted their retries"
    );
}

/// Allocation path metrics recorder.
pub struct AllocatorMetrics;

impl AllocatorMetrics {
    /// Record a decided request.
    pub fn record_outcome(outcome: &'static str) {
        counter!("flashsale_requests_total", "outcome" => outcome).increment(1);
    }

    /// Record a committed batch.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_batch(size: usize, commit: Duration) {
        histogram!("flashsale_batch_size").record(size as f64);
        histogram!("flashsale_batch_commit_duration_seconds").record(commit.as_secs_f64());
    }

    /// Record the current queue depth of a SKU.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_queue_depth(sku: &str, depth: u64) {
        gauge!("flashsale_queue_depth", "sku" => sku.to_string()).set(depth as f64);
    }

    /// Record a submission rejected before queueing.
    pub fn record_rejection(reason: &'static str) {
        counter!("flashsale_rejected_total", "reason" => reason).increment(1);
    }

    /// Record a supervisor restart.
    pub fn record_restart(sku: &str) {
        counter!("flashsale_worker_restarts_total", "sku" => sku.to_string()).increment(1);
    }
}

/// Expiry and checkout metrics recorder.
pub struct ExpiryMetrics;

impl ExpiryMetrics {
    /// Record reservations released by `trigger`.
    pub fn record_released(trigger: &'static str, count: usize) {
        counter!("flashsale_released_total", "trigger" => trigger).increment(count as u64);
    }

    /// Record a confirmation.
    pub fn record_confirmed() {
        counter!("flashsale_confirmed_total").increment(1);
    }
}

/// Event publishing metrics recorder.
pub struct EventMetrics;

impl EventMetrics {
    /// Record a published event.
    pub fn record_publish(event_type: &'static str) {
        counter!("flashsale_events_published_total", "event_type" => event_type).increment(1);
    }

    /// Record a failed publish.
    pub fn record_publish_error() {
        counter!("flashsale_event_publish_errors_total").increment(1);
    }
}

/// Circuit breaker metrics recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record a state transition.
    pub fn record_state_change(name: &str, to: &'static str, gauge_value: f64) {
        gauge!("flashsale_circuit_breaker_state", "sku" => name.to_string()).set(gauge_value);
        counter!(
            "flashsale_circuit_breaker_state_change",
            "sku" => name.to_string(),
            "to" => to
        )
        .increment(1);
    }

    /// Record a rejected call.
    pub fn record_rejection(name: &str) {
        counter!("flashsale_circuit_breaker_rejections_total", "sku" => name.to_string())
            .increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt(operation: &'static str) {
        counter!("flashsale_retry_attempts_total", "operation" => operation).increment(1);
    }

    /// Record an operation that succeeded after retrying.
    pub fn record_success(operation: &'static str) {
        counter!("flashsale_retry_successes_total", "operation" => operation).increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted(operation: &'static str) {
        counter!("flashsale_retry_exhausted_total", "operation" => operation).increment(1);
    }
}
