use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total operations executed. Labels: op, status.
pub const OPS_TOTAL: &str = "amenityd_ops_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "amenityd_op_duration_seconds";

/// Counter: admission rejections (expected business outcomes). Labels: reason.
pub const ADMISSION_REJECTIONS_TOTAL: &str = "amenityd_admission_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "amenityd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "amenityd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "amenityd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "amenityd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "amenityd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::CreateResource { .. } => "create_resource",
        Request::UpdateResource { .. } => "update_resource",
        Request::SetResourceActive { .. } => "set_resource_active",
        Request::DeleteResource { .. } => "delete_resource",
        Request::ReplaceWindows { .. } => "replace_windows",
        Request::ListResources { .. } => "list_resources",
        Request::ListOpenSlots { .. } => "list_open_slots",
        Request::BookSlot { .. } => "book_slot",
        Request::BookInterval { .. } => "book_interval",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::ListBookings { .. } => "list_bookings",
    }
}
