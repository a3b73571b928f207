use std::net::SocketAddr;

use crate::server::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: request, status.
pub const REQUESTS_TOTAL: &str = "tablebook_requests_total";

/// Histogram: request latency in seconds. Labels: request.
pub const REQUEST_DURATION_SECONDS: &str = "tablebook_request_duration_seconds";

/// Histogram: time inside the atomic unit of a booking write. Labels: op.
pub const BOOKING_DURATION_SECONDS: &str = "tablebook_booking_duration_seconds";

/// Counter: rejected booking writes. Labels: op, reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "tablebook_booking_rejections_total";

/// Counter: committed lifecycle transitions. Labels: kind.
pub const TRANSITIONS_TOTAL: &str = "tablebook_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tablebook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tablebook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tablebook_connections_rejected_total";

/// Counter: handshake failures.
pub const AUTH_FAILURES_TOTAL: &str = "tablebook_auth_failures_total";

/// Histogram: waiting for atomic-unit locks, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "tablebook_lock_wait_seconds";

/// Counter: atomic units abandoned on lock timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "tablebook_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tablebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tablebook_wal_flush_batch_size";

/// Counter: events handed to connection outboxes. Labels: kind.
pub const FANOUT_DELIVERED_TOTAL: &str = "tablebook_fanout_delivered_total";

/// Counter: events skipped for full or closed outboxes. Labels: kind.
pub const FANOUT_DROPPED_TOTAL: &str = "tablebook_fanout_dropped_total";

/// Counter: reservations completed by the sweeper.
pub const SWEEP_COMPLETED_TOTAL: &str = "tablebook_sweep_completed_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a request to a short label for metrics.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::Hello { .. } => "hello",
        Request::Join { .. } => "join",
        Request::Leave { .. } => "leave",
        Request::ListTables => "list_tables",
        Request::UpsertTable { .. } => "upsert_table",
        Request::SetTableStatus { .. } => "set_table_status",
        Request::CheckAvailability { .. } => "check_availability",
        Request::AvailableTables { .. } => "available_tables",
        Request::Create { .. } => "create",
        Request::Update { .. } => "update",
        Request::SetStatus { .. } => "set_status",
        Request::Cancel { .. } => "cancel",
        Request::Delete { .. } => "delete",
        Request::Get { .. } => "get",
        Request::MyReservations { .. } => "my_reservations",
        Request::TableReservations { .. } => "table_reservations",
    }
}
