//! Prometheus metrics for the CSI driver
//!
//! Covers CSI operation outcomes, backend retries, placement decisions
//! and accelerator PCI function usage.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI operations by type and status
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: Duration of CSI operations in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Counter: Number of retried backend calls
    pub const CSI_RETRIES_TOTAL: &str = "csi_retries_total";
    /// Counter: Scheduler decisions by outcome
    pub const CSI_SCHEDULE_TOTAL: &str = "csi_schedule_total";
    /// Counter: Backend calls by endpoint and outcome
    pub const CSI_BACKEND_REQUESTS_TOTAL: &str = "csi_backend_requests_total";
    /// Gauge: PCI functions currently claimed by this node
    pub const CSI_PCI_FUNCTIONS_ALLOCATED: &str = "csi_pci_functions_allocated";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a CSI operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a retry attempt
pub fn record_retry(operation: &str) {
    counter!(names::CSI_RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Record a placement decision ("placed", "exhausted")
pub fn record_schedule(outcome: &str) {
    counter!(names::CSI_SCHEDULE_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Record one backend management call
pub fn record_backend_request(endpoint: &str, success: bool) {
    counter!(
        names::CSI_BACKEND_REQUESTS_TOTAL,
        "endpoint" => endpoint.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

/// Track PCI function claims (+1 on allocation, -1 on release)
pub fn adjust_pci_functions(delta: f64) {
    gauge!(names::CSI_PCI_FUNCTIONS_ALLOCATED).increment(delta);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_code, duration);
    }

    /// Complete the operation using the outcome of a gRPC call
    pub fn finish<T>(self, result: &Result<T, tonic::Status>) {
        match result {
            Ok(_) => self.success(),
            Err(status) => self.failure(&format!("{:?}", status.code()).to_lowercase()),
        }
    }
}
