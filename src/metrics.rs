//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Target link connection status and keepalive checks
//! - Transfer attempts and body bytes
//! - Task completion status
//! - Lane pool occupancy and queue ingestion
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `distributor_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by this crate; without one every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Target Link Metrics
// =============================================================================

/// Record a link connection attempt.
pub fn record_link_connect(target: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("distributor_link_connects_total", "target" => target.to_string(), "status" => status)
        .increment(1);
}

/// Record a keepalive result.
pub fn record_keepalive(target: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("distributor_keepalive_pings_total", "target" => target.to_string(), "status" => status)
        .increment(1);
}

/// Record a link being marked broken.
pub fn record_link_broken(target: &str) {
    counter!("distributor_link_broken_total", "target" => target.to_string()).increment(1);
}

// =============================================================================
// Transfer Metrics
// =============================================================================

/// Record one transfer attempt outcome (`all_same`, `ok`, `failed`).
pub fn record_transfer_attempt(target: &str, outcome: &str) {
    counter!(
        "distributor_transfer_attempts_total",
        "target" => target.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record body bytes written to a target.
pub fn record_bytes_sent(target: &str, bytes: u64) {
    counter!("distributor_body_bytes_total", "target" => target.to_string()).increment(bytes);
}

/// Record the duration of a full task (all filters × targets).
pub fn record_task_duration(duration: Duration) {
    histogram!("distributor_task_duration_seconds").record(duration.as_secs_f64());
}

/// Record a task's final status code.
pub fn record_task_status(status: u16) {
    counter!("distributor_task_completions_total", "status" => status.to_string()).increment(1);
}

/// Record a store status write failure.
pub fn record_store_update_failure() {
    counter!("distributor_store_update_failures_total").increment(1);
}

/// Record a SQLite busy retry.
pub fn record_store_retry(operation: &str) {
    counter!("distributor_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Scheduling Metrics
// =============================================================================

/// Gauge for lanes currently free in the pool.
pub fn set_lanes_available(count: usize) {
    gauge!("distributor_lanes_available").set(count as f64);
}

/// Record a task pushed onto the job queue by a producer (`poll`, `control`).
pub fn record_enqueued(producer: &str) {
    counter!("distributor_tasks_enqueued_total", "producer" => producer.to_string()).increment(1);
}

/// Record a pending row rejected during validation.
pub fn record_rejected(reason: &str) {
    counter!("distributor_tasks_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("distributor_engine_state").set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only check the calls do not panic without a recorder installed.

    #[test]
    fn test_record_link_metrics() {
        record_link_connect("edge-1", true);
        record_link_connect("edge-1", false);
        record_keepalive("edge-1", true);
        record_keepalive("", false);
        record_link_broken("edge-1");
    }

    #[test]
    fn test_record_transfer_metrics() {
        record_transfer_attempt("edge-1", "all_same");
        record_transfer_attempt("edge-1", "ok");
        record_transfer_attempt("edge-1", "failed");
        record_bytes_sent("edge-1", 4096);
        record_task_duration(Duration::from_millis(12));
        record_task_status(200);
        record_task_status(500);
        record_store_update_failure();
        record_store_retry("update_status");
    }

    #[test]
    fn test_set_engine_state_all_states() {
        set_engine_state("Created");
        set_engine_state("Starting");
        set_engine_state("Running");
        set_engine_state("ShuttingDown");
        set_engine_state("Stopped");
        set_engine_state("Failed");
        set_engine_state("Unknown");
    }

    #[test]
    fn test_scheduling_metrics() {
        set_lanes_available(0);
        set_lanes_available(10);
        record_enqueued("poll");
        record_enqueued("control");
        record_rejected("checksum");
    }
}
