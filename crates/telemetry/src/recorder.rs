//! Metric names:
//! - `kavach_units_dispatched_total{stage}`
//! - `kavach_unit_retries_total{stage}`
//! - `kavach_units_finished_total{stage,status}`
//! - `kavach_unit_duration_seconds{stage}`
//! - `kavach_engine_invocations_total{engine,outcome}`
//! - `kavach_jobs_finished_total{status}`
//! - `kavach_scheduler_queue_depth`
//!
//! Without an installed recorder every call is a no-op.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Serve `/metrics` on `addr`. Must be called inside a tokio runtime.
pub fn install_prometheus(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("failed to start metrics exporter on {addr}"))?;
    info!(%addr, "metrics exporter listening");
    Ok(())
}

pub fn record_unit_dispatched(stage: &'static str) {
    counter!("kavach_units_dispatched_total", "stage" => stage).increment(1);
}

pub fn record_unit_retry(stage: &'static str) {
    counter!("kavach_unit_retries_total", "stage" => stage).increment(1);
}

pub fn record_unit_finished(stage: &'static str, status: &'static str, elapsed: Duration) {
    counter!("kavach_units_finished_total", "stage" => stage, "status" => status).increment(1);
    histogram!("kavach_unit_duration_seconds", "stage" => stage).record(elapsed.as_secs_f64());
}

pub fn record_engine_invocation(engine: &str, outcome: &'static str) {
    counter!(
        "kavach_engine_invocations_total",
        "engine" => engine.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_job_finished(status: &'static str) {
    counter!("kavach_jobs_finished_total", "status" => status).increment(1);
}

pub fn record_queue_depth(depth: usize) {
    gauge!("kavach_scheduler_queue_depth").set(depth as f64);
}
