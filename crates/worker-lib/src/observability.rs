//! Observability infrastructure for the anomaly worker
//!
//! Provides:
//! - Prometheus metrics (job and fit latency, per-class error counters,
//!   anomalies by metric type and severity, consumer cursor position)
//! - Structured JSON logging with tracing

use crate::models::{AnomalyRecord, JobResult, MetricType};
use crate::store::SavedArtifact;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for job and fit latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Label value for metric types outside [`MetricType::KNOWN`]
pub const OTHER_METRIC_LABEL: &str = "other";

static GLOBAL_METRICS: OnceLock<WorkerMetricsInner> = OnceLock::new();

struct WorkerMetricsInner {
    job_latency_seconds: Histogram,
    fit_latency_seconds: Histogram,
    entries_received: IntCounter,
    jobs_published: IntCounter,
    decode_errors: IntCounter,
    processing_errors: IntCounter,
    publish_errors: IntCounter,
    transport_errors: IntCounter,
    metric_failures: IntCounterVec,
    anomalies_detected: IntCounterVec,
    models_saved: IntCounter,
    model_save_errors: IntCounter,
    cursor_timestamp_ms: IntGauge,
}

impl WorkerMetricsInner {
    fn new() -> Self {
        Self {
            job_latency_seconds: register_histogram!(
                "anomaly_worker_job_latency_seconds",
                "Time spent processing one job end to end",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register job_latency_seconds"),

            fit_latency_seconds: register_histogram!(
                "anomaly_worker_fit_latency_seconds",
                "Time spent fitting and scoring one metric type",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register fit_latency_seconds"),

            entries_received: register_int_counter!(
                "anomaly_worker_entries_received_total",
                "Stream entries consumed from the input stream"
            )
            .expect("Failed to register entries_received"),

            jobs_published: register_int_counter!(
                "anomaly_worker_jobs_published_total",
                "Job results appended to the output stream"
            )
            .expect("Failed to register jobs_published"),

            decode_errors: register_int_counter!(
                "anomaly_worker_decode_errors_total",
                "Entries skipped because the payload could not be decoded"
            )
            .expect("Failed to register decode_errors"),

            processing_errors: register_int_counter!(
                "anomaly_worker_processing_errors_total",
                "Jobs aborted during processing"
            )
            .expect("Failed to register processing_errors"),

            publish_errors: register_int_counter!(
                "anomaly_worker_publish_errors_total",
                "Job results that could not be published"
            )
            .expect("Failed to register publish_errors"),

            transport_errors: register_int_counter!(
                "anomaly_worker_transport_errors_total",
                "Failed polls of the input stream"
            )
            .expect("Failed to register transport_errors"),

            metric_failures: register_int_counter_vec!(
                "anomaly_worker_metric_failures_total",
                "Metric types excluded from a job because detection failed",
                &["metric_type"]
            )
            .expect("Failed to register metric_failures"),

            anomalies_detected: register_int_counter_vec!(
                "anomaly_worker_anomalies_detected_total",
                "Samples labeled anomalous",
                &["metric_type", "severity"]
            )
            .expect("Failed to register anomalies_detected"),

            models_saved: register_int_counter!(
                "anomaly_worker_models_saved_total",
                "Model artifacts written"
            )
            .expect("Failed to register models_saved"),

            model_save_errors: register_int_counter!(
                "anomaly_worker_model_save_errors_total",
                "Model artifact writes that failed"
            )
            .expect("Failed to register model_save_errors"),

            cursor_timestamp_ms: register_int_gauge!(
                "anomaly_worker_cursor_timestamp_ms",
                "Millisecond part of the last consumed entry id"
            )
            .expect("Failed to register cursor_timestamp_ms"),
        }
    }
}

/// Worker metrics for Prometheus exposition
///
/// A lightweight handle to the process-global metrics; clones share the
/// same collectors.
#[derive(Clone)]
pub struct WorkerMetrics {
    _private: (),
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(WorkerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &WorkerMetricsInner {
        GLOBAL_METRICS.get_or_init(WorkerMetricsInner::new)
    }

    pub fn observe_job_latency(&self, elapsed: Duration) {
        self.inner().job_latency_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn observe_fit_latency(&self, elapsed: Duration) {
        self.inner().fit_latency_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn inc_entries_received(&self) {
        self.inner().entries_received.inc();
    }

    pub fn inc_jobs_published(&self) {
        self.inner().jobs_published.inc();
    }

    pub fn inc_decode_errors(&self) {
        self.inner().decode_errors.inc();
    }

    pub fn inc_processing_errors(&self) {
        self.inner().processing_errors.inc();
    }

    pub fn inc_publish_errors(&self) {
        self.inner().publish_errors.inc();
    }

    pub fn inc_transport_errors(&self) {
        self.inner().transport_errors.inc();
    }

    pub fn inc_metric_failures(&self, metric_type: &str) {
        self.inner()
            .metric_failures
            .with_label_values(&[metric_label(metric_type)])
            .inc();
    }

    pub fn inc_anomaly(&self, metric_type: &str, severity: &str) {
        self.inner()
            .anomalies_detected
            .with_label_values(&[metric_label(metric_type), severity])
            .inc();
    }

    pub fn inc_models_saved(&self) {
        self.inner().models_saved.inc();
    }

    pub fn inc_model_save_errors(&self) {
        self.inner().model_save_errors.inc();
    }

    pub fn set_cursor(&self, timestamp_ms: u64) {
        self.inner()
            .cursor_timestamp_ms
            .set(i64::try_from(timestamp_ms).unwrap_or(i64::MAX));
    }
}

/// Structured logger for worker events
///
/// Every event carries an `event` field and the worker name so that the JSON
/// log stream can be filtered without parsing messages.
#[derive(Clone)]
pub struct StructuredLogger {
    worker_name: String,
}

impl StructuredLogger {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn log_startup(&self, version: &str, input_stream: &str, output_stream: &str) {
        info!(
            event = "worker_started",
            worker = %self.worker_name,
            version = %version,
            input_stream = %input_stream,
            output_stream = %output_stream,
            "Anomaly worker started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "worker_shutdown",
            worker = %self.worker_name,
            reason = %reason,
            "Anomaly worker shutting down"
        );
    }

    pub fn log_job_completed(&self, entry_id: &str, result: &JobResult, elapsed: Duration) {
        info!(
            event = "job_completed",
            worker = %self.worker_name,
            entry_id = %entry_id,
            job_id = %result.job_id,
            location = %result.location,
            metrics_processed = result.metrics_processed.len(),
            models_saved = result.models_saved,
            anomalies = result.total_anomalies_found,
            elapsed_ms = elapsed.as_millis() as u64,
            "Job result published"
        );
    }

    pub fn log_anomaly(&self, job_id: &str, location: &str, record: &AnomalyRecord) {
        info!(
            event = "anomaly_detected",
            worker = %self.worker_name,
            job_id = %job_id,
            location = %location,
            metric_type = %record.metric_type,
            timestamp = %record.timestamp.to_rfc3339(),
            value = record.value,
            anomaly_score = record.anomaly_score,
            severity = %record.severity,
            "Anomaly detected"
        );
    }

    pub fn log_model_saved(&self, job_id: &str, metric_type: &str, saved: &SavedArtifact) {
        info!(
            event = "model_saved",
            worker = %self.worker_name,
            job_id = %job_id,
            metric_type = %metric_type,
            path = %saved.path.display(),
            checksum = %saved.checksum,
            size_bytes = saved.size_bytes,
            "Model artifact written"
        );
    }

    /// Log a change of stream connectivity
    pub fn log_transport_status(&self, connected: bool, retry_in: Option<Duration>) {
        if connected {
            info!(
                event = "transport_recovered",
                worker = %self.worker_name,
                "Input stream reachable again"
            );
        } else {
            warn!(
                event = "transport_degraded",
                worker = %self.worker_name,
                retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
                "Input stream unreachable, backing off"
            );
        }
    }
}

/// Metric type names come from job payloads; unknown ones share one label
fn metric_label(metric_type: &str) -> &str {
    if MetricType::KNOWN.contains(&metric_type) {
        metric_type
    } else {
        OTHER_METRIC_LABEL
    }
}
