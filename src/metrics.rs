//! Prometheus metrics for bleepload.
//!
//! Metric updates go through the `metrics` facade and are no-ops unless a
//! recorder is installed.  [`init_metrics`] installs the
//! `metrics-exporter-prometheus` recorder with an HTTP scrape listener.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

// -- Metric name constants ----------------------------------------------------

/// Parts acknowledged by the server (counter).
pub const PARTS_UPLOADED_TOTAL: &str = "bleepload_parts_uploaded_total";

/// Network attempts made for parts, retries included (counter).
pub const PART_ATTEMPTS_TOTAL: &str = "bleepload_part_attempts_total";

/// Retries after transient failures (counter). Labels: operation.
pub const RETRIES_TOTAL: &str = "bleepload_retries_total";

/// Bytes in acknowledged parts and single-shot objects (counter).
pub const BYTES_UPLOADED_TOTAL: &str = "bleepload_bytes_uploaded_total";

/// Finished transfers (counter). Labels: outcome.
pub const UPLOADS_TOTAL: &str = "bleepload_uploads_total";

/// Time to upload one part, retries included (histogram).
pub const PART_UPLOAD_DURATION_SECONDS: &str = "bleepload_part_upload_duration_seconds";

// -- Global recorder installation ---------------------------------------------

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the global Prometheus recorder serving `/metrics` on `listen`.
/// Only the first call installs; later calls are no-ops.
pub fn init_metrics(listen: &str) -> anyhow::Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics listen address {listen:?}: {e}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    let _ = INSTALLED.set(addr);
    describe_metrics();
    Ok(())
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(PARTS_UPLOADED_TOTAL, "Parts acknowledged by the server");
    describe_counter!(PART_ATTEMPTS_TOTAL, "Part upload attempts, retries included");
    describe_counter!(RETRIES_TOTAL, "Retries after transient failures");
    describe_counter!(BYTES_UPLOADED_TOTAL, "Bytes acknowledged by the server");
    describe_counter!(UPLOADS_TOTAL, "Finished transfers by outcome");
    describe_histogram!(
        PART_UPLOAD_DURATION_SECONDS,
        "Part upload duration in seconds"
    );
}

// -- Recording helpers --------------------------------------------------------

pub fn record_retry(operation: &'static str) {
    counter!(RETRIES_TOTAL, "operation" => operation).increment(1);
}

pub fn record_part_attempts(attempts: u32) {
    counter!(PART_ATTEMPTS_TOTAL).increment(u64::from(attempts));
}

/// A part of `bytes` was acknowledged after `elapsed`.
pub fn record_part_uploaded(bytes: u64, elapsed: Duration) {
    counter!(PARTS_UPLOADED_TOTAL).increment(1);
    counter!(BYTES_UPLOADED_TOTAL).increment(bytes);
    histogram!(PART_UPLOAD_DURATION_SECONDS).record(elapsed.as_secs_f64());
}

/// A single-shot object of `bytes` was stored.
pub fn record_object_uploaded(bytes: u64) {
    counter!(BYTES_UPLOADED_TOTAL).increment(bytes);
}

/// A transfer finished; `outcome` is `"completed"` or an error code.
pub fn record_upload_finished(outcome: &'static str) {
    counter!(UPLOADS_TOTAL, "outcome" => outcome).increment(1);
}
