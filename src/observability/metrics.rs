use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the idempotency guard.
///
/// Calls are no-ops until a recorder is installed with [`init_metrics`].
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    pub fn record_acquired(&self, operation: &str) {
        counter!("idempotency_acquired_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn record_duplicate(&self, operation: &str) {
        counter!("idempotency_duplicate_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn record_replayed(&self, operation: &str) {
        counter!("idempotency_replayed_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn record_reopened(&self, operation: &str) {
        counter!("idempotency_reopened_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn record_retry_exhausted(&self, operation: &str) {
        counter!("idempotency_retry_exhausted_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn record_wait_timeout(&self, operation: &str) {
        counter!("idempotency_wait_timeout_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn record_operation_failed(&self, operation: &str, surfaced: bool) {
        counter!("idempotency_operation_failed_total", "operation" => operation.to_string(), "surfaced" => surfaced.to_string()).increment(1);
    }

    pub fn record_token_missing(&self, operation: &str, caller: &str) {
        counter!("idempotency_token_missing_total", "operation" => operation.to_string(), "caller" => caller.to_string()).increment(1);
    }

    pub fn record_guard_latency(&self, operation: &str, duration_ms: f64) {
        histogram!("idempotency_guard_duration_ms", "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_store_operation(&self, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_store_operations_total", "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_store_operation_duration_ms", "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_config_refresh(&self, success: bool) {
        counter!("idempotency_config_refresh_total", "success" => success.to_string()).increment(1);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes the metrics system and returns the Prometheus handle.
pub fn init_metrics() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    METRICS.get_or_init(Metrics::new);

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("idempotency_acquired_total", Unit::Count, "Invocations that became the owner of a token");
    describe_counter!("idempotency_duplicate_total", Unit::Count, "Duplicate invocations rejected in fail-fast mode");
    describe_counter!("idempotency_replayed_total", Unit::Count, "Duplicate invocations answered from the result cache");
    describe_counter!("idempotency_reopened_total", Unit::Count, "FAILED records reopened for retry");
    describe_counter!("idempotency_retry_exhausted_total", Unit::Count, "Tokens that exceeded the retry limit");
    describe_counter!("idempotency_wait_timeout_total", Unit::Count, "Wait-and-replay invocations that gave up polling");
    describe_counter!("idempotency_operation_failed_total", Unit::Count, "Guarded operations that returned an error");
    describe_counter!("idempotency_token_missing_total", Unit::Count, "Invocations without a resolvable token");
    describe_histogram!("idempotency_guard_duration_ms", Unit::Milliseconds, "End-to-end guard latency in milliseconds");

    describe_counter!("idempotency_store_operations_total", Unit::Count, "Total state store operations");
    describe_histogram!("idempotency_store_operation_duration_ms", Unit::Milliseconds, "State store operation latency in milliseconds");

    describe_counter!("idempotency_config_refresh_total", Unit::Count, "Live configuration refresh attempts");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
