// Prometheus metrics for the Arbiter API

use arbiter_common::{GradingOutcome, OverallStatus};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Gradings finished (language, overall status)
    pub static ref GRADINGS_COMPLETED: CounterVec = CounterVec::new(
        Opts::new("arbiter_gradings_completed_total", "Total number of gradings completed"),
        &["language", "status"]
    )
    .expect("metric can be created");

    // Wall time of a whole grading, compile step included
    pub static ref GRADING_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "arbiter_grading_duration_ms",
            "Grading duration in milliseconds"
        )
        .buckets(vec![50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0]),
        &["language"]
    )
    .expect("metric can be created");

    pub static ref SAFETY_REJECTIONS: CounterVec = CounterVec::new(
        Opts::new("arbiter_safety_rejections_total", "Submissions rejected by the safety screen"),
        &["language"]
    )
    .expect("metric can be created");

    // Host faults that need an operator
    pub static ref SYSTEM_ERRORS: CounterVec = CounterVec::new(
        Opts::new("arbiter_system_errors_total", "Gradings that ended in a system error"),
        &["language"]
    )
    .expect("metric can be created");

    pub static ref GRADINGS_IN_FLIGHT: IntGauge = IntGauge::new(
        "arbiter_gradings_in_flight",
        "Gradings currently running"
    )
    .expect("metric can be created");

    pub static ref JOBS_QUEUED: CounterVec = CounterVec::new(
        Opts::new("arbiter_jobs_queued_total", "Grading jobs pushed to the queue"),
        &["language"]
    )
    .expect("metric can be created");
}

/// Register all collectors with the global registry
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(GRADINGS_COMPLETED.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(GRADING_DURATION.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(SAFETY_REJECTIONS.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(SYSTEM_ERRORS.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(GRADINGS_IN_FLIGHT.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(JOBS_QUEUED.clone()))
        .expect("collector can be registered");
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record a finished grading
pub fn record_grading(language: &str, outcome: &GradingOutcome, elapsed: Duration) {
    let status = outcome.overall_status.as_str();
    GRADINGS_COMPLETED.with_label_values(&[language, status]).inc();
    GRADING_DURATION
        .with_label_values(&[language])
        .observe(elapsed.as_secs_f64() * 1000.0);

    if outcome.overall_status == OverallStatus::Rejected {
        SAFETY_REJECTIONS.with_label_values(&[language]).inc();
    }
    // includes Partial outcomes that stopped on a host fault
    if outcome.needs_investigation() {
        SYSTEM_ERRORS.with_label_values(&[language]).inc();
    }
}

pub fn record_job_queued(language: &str) {
    JOBS_QUEUED.with_label_values(&[language]).inc();
}
