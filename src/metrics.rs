//! Prometheus metrics for the orchestration core
//!
//! All metrics live in the default registry and are exported as text by
//! [`gather_text`] (served at `/metrics`).

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────────────

    /// Operations executed against the backend.
    ///
    /// Labels:
    /// - operation: list_vms, create_vm, start_vm, stop_vm, delete_vm
    /// - outcome: ok or a failure kind (backend_unavailable, upstream_timeout, ...)
    pub static ref OPERATIONS_TOTAL: CounterVec = register_counter_vec!(
        "vmpilot_operations_total",
        "Operations executed against the virtualization backend",
        &["operation", "outcome"]
    ).expect("failed to register OPERATIONS_TOTAL metric");

    /// Wall-clock duration of backend operations, in seconds.
    pub static ref OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "vmpilot_operation_duration_seconds",
        "Duration of backend operations",
        &["operation"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).expect("failed to register OPERATION_DURATION metric");

    /// Mutating operations rejected because the VM was busy.
    pub static ref OPERATION_CONFLICTS_TOTAL: CounterVec = register_counter_vec!(
        "vmpilot_operation_conflicts_total",
        "Operations rejected because another operation held the VM",
        &["operation"]
    ).expect("failed to register OPERATION_CONFLICTS_TOTAL metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Intent resolution
    // ─────────────────────────────────────────────────────────────────────────────

    /// Resolution results.
    ///
    /// Labels:
    /// - result: operation, plain_reply, invalid, unavailable, timeout
    pub static ref RESOLUTIONS_TOTAL: CounterVec = register_counter_vec!(
        "vmpilot_resolutions_total",
        "Intent resolutions by result",
        &["result"]
    ).expect("failed to register RESOLUTIONS_TOTAL metric");

    /// Language model call duration, in seconds.
    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "vmpilot_llm_call_duration_seconds",
        "Duration of language model calls",
        &["model"],
        vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register LLM_CALL_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Sessions and inventory
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished turns by final status (completed, failed, cancelled).
    pub static ref TURNS_TOTAL: CounterVec = register_counter_vec!(
        "vmpilot_turns_total",
        "Finished conversation turns by status",
        &["status"]
    ).expect("failed to register TURNS_TOTAL metric");

    pub static ref TURNS_IN_FLIGHT: Gauge = register_gauge!(
        "vmpilot_turns_in_flight",
        "Turns currently running"
    ).expect("failed to register TURNS_IN_FLIGHT metric");

    /// Number of VMs in the published inventory snapshot.
    pub static ref INVENTORY_VMS: Gauge = register_gauge!(
        "vmpilot_inventory_vms",
        "VMs in the cached inventory"
    ).expect("failed to register INVENTORY_VMS metric");

    /// Inventory refreshes by result (ok, error).
    pub static ref INVENTORY_REFRESHES_TOTAL: CounterVec = register_counter_vec!(
        "vmpilot_inventory_refreshes_total",
        "Inventory refreshes against the backend",
        &["result"]
    ).expect("failed to register INVENTORY_REFRESHES_TOTAL metric");
}

/// Encode every registered metric in the Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_metrics() {
        OPERATIONS_TOTAL.with_label_values(&["list_vms", "ok"]).inc();
        TURNS_IN_FLIGHT.set(0.0);
        let text = gather_text();
        assert!(text.contains("vmpilot_operations_total"));
        assert!(text.contains("vmpilot_turns_in_flight"));
    }
}
