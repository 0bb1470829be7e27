use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Metric name prefix for all jobrank metrics
const PREFIX: &str = "jobrank";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Cron adapter
    pub static ref CRON_JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_cron_job_duration_seconds"),
            "Duration of cron-triggered runs in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
        &["name", "success"]
    ).expect("Failed to create cron_job_duration_seconds metric");

    // Scheduler
    pub static ref JOB_EXECUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_job_executions_total"), "Total job executions by executor and outcome"),
        &["executor", "status"]
    ).expect("Failed to create job_executions_total metric");

    pub static ref JOB_EXECUTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_execution_duration_seconds"),
            "Job execution duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0]),
        &["executor"]
    ).expect("Failed to create job_execution_duration_seconds metric");

    pub static ref SCHEDULER_RUNNING_JOBS: IntGauge = IntGauge::new(
        format!("{PREFIX}_scheduler_running_jobs"),
        "Job bodies currently executing"
    ).expect("Failed to create scheduler_running_jobs metric");

    pub static ref SCHEDULER_PREEMPT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_scheduler_preempt_total"), "Preemption attempts by outcome"),
        &["outcome"]
    ).expect("Failed to create scheduler_preempt_total metric");

    // Leases
    pub static ref LOCK_LEADERSHIP: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_lock_leadership"), "1 while this process holds the lease"),
        &["key"]
    ).expect("Failed to create lock_leadership metric");

    // Ranking
    pub static ref RANKING_ITEMS_SCANNED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_ranking_items_scanned_total"),
        "Content items scored by the ranking"
    ).expect("Failed to create ranking_items_scanned_total metric");

    pub static ref RANKING_PAGES_FETCHED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_ranking_pages_fetched_total"),
        "Content pages fetched by the ranking"
    ).expect("Failed to create ranking_pages_fetched_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(CRON_JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_EXECUTION_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULER_RUNNING_JOBS.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULER_PREEMPT_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(LOCK_LEADERSHIP.clone()));
    let _ = REGISTRY.register(Box::new(RANKING_ITEMS_SCANNED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RANKING_PAGES_FETCHED_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record one run of a cron-triggered job
pub fn record_cron_job(name: &str, success: bool, duration: Duration) {
    let success = if success { "true" } else { "false" };
    CRON_JOB_DURATION_SECONDS
        .with_label_values(&[name, success])
        .observe(duration.as_secs_f64());
}

/// Record a finished job body; `status` is one of success, failed, panic
pub fn record_job_execution(executor: &str, status: &str, duration: Duration) {
    JOB_EXECUTIONS_TOTAL
        .with_label_values(&[executor, status])
        .inc();
    JOB_EXECUTION_DURATION_SECONDS
        .with_label_values(&[executor])
        .observe(duration.as_secs_f64());
}

pub fn job_started() {
    SCHEDULER_RUNNING_JOBS.inc();
}

pub fn job_finished() {
    SCHEDULER_RUNNING_JOBS.dec();
}

/// `outcome` is one of acquired, empty, error, timeout
pub fn record_preempt(outcome: &str) {
    SCHEDULER_PREEMPT_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn set_lock_leadership(key: &str, held: bool) {
    LOCK_LEADERSHIP
        .with_label_values(&[key])
        .set(if held { 1.0 } else { 0.0 });
}

pub fn record_ranking_page(items: usize) {
    RANKING_PAGES_FETCHED_TOTAL.inc();
    RANKING_ITEMS_SCANNED_TOTAL.inc_by(items as u64);
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve `/metrics` until `shutdown` is cancelled.
pub async fn run_metrics_server(port: u16, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;

    axum::serve(listener, make_metrics_app())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
