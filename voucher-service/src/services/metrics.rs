//! Prometheus metrics for voucher-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// gRPC request counter by method and status.
pub static GRPC_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "voucher_grpc_requests_total",
        "Total number of gRPC requests",
        &["method", "status"]
    )
    .expect("Failed to register grpc_requests_total")
});

/// gRPC request duration histogram by method.
pub static GRPC_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "voucher_grpc_request_duration_seconds",
        "gRPC request duration in seconds",
        &["method"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register grpc_request_duration")
});

/// Authorization decisions by access level and outcome.
pub static AUTHZ_DECISIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "voucher_authz_decisions_total",
        "Authorization decisions",
        &["access", "decision"]
    )
    .expect("Failed to register authz_decisions_total")
});

/// Vouchers issued (no serial/tenant labels to bound cardinality).
pub static VOUCHERS_ISSUED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "voucher_vouchers_issued_total",
        "Ownership vouchers issued",
        &["status"]
    )
    .expect("Failed to register vouchers_issued_total")
});

/// Store operation duration histogram.
pub static STORE_OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "voucher_store_operation_duration_seconds",
        "Store operation duration in seconds",
        &["operation"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register store_operation_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&GRPC_REQUESTS_TOTAL);
    Lazy::force(&GRPC_REQUEST_DURATION);
    Lazy::force(&AUTHZ_DECISIONS_TOTAL);
    Lazy::force(&VOUCHERS_ISSUED_TOTAL);
    Lazy::force(&STORE_OPERATION_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_exported() {
        init_metrics();
        VOUCHERS_ISSUED_TOTAL.with_label_values(&["ok"]).inc();
        let text = get_metrics();
        assert!(text.contains("voucher_vouchers_issued_total"));
    }
}
