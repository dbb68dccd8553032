use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

const CALL_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];
const BATCH_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0];

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full("grading_call_duration_seconds".to_string()), CALL_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full("grading_batch_duration_seconds".to_string()), BATCH_BUCKETS)?
        .install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    describe();
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

fn describe() {
    describe_counter!("grading_submissions_total", "Graded submissions by final status");
    describe_counter!("grading_engine_retries_total", "Retried grading engine calls by error kind");
    describe_counter!("grading_reprompts_total", "Re-prompts sent after an unparseable reply");
    describe_counter!("grading_failures_total", "Failed submissions by failure reason");
    describe_counter!("grading_sessions_released_total", "Released session workspaces by reason");
    describe_histogram!("grading_call_duration_seconds", Unit::Seconds, "Per-submission grading time");
    describe_histogram!("grading_batch_duration_seconds", Unit::Seconds, "Whole-batch grading time");
    describe_counter!("http_requests_total", "HTTP responses by status");
    describe_histogram!("http_request_duration_seconds", Unit::Seconds, "HTTP request latency");
}
