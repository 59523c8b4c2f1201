use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtside_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtside_query_duration_seconds";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: slot requests. Labels: outcome (admitted, overbooked, waitlisted, rejected).
pub const REQUESTS_TOTAL: &str = "courtside_requests_total";

/// Counter: checkouts. Labels: status (ok, conflict, storage_error).
pub const CHECKOUTS_TOTAL: &str = "courtside_checkouts_total";

/// Counter: approval decisions. Labels: decision (approved, rejected).
pub const APPROVALS_TOTAL: &str = "courtside_approvals_total";

/// Counter: waitlist heads promoted to a booking.
pub const WAITLIST_PROMOTIONS_TOTAL: &str = "courtside_waitlist_promotions_total";

/// Counter: rows expired by the sweeper. Labels: kind (cart, waitlist).
pub const SWEEP_EXPIRED_TOTAL: &str = "courtside_sweep_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtside_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtside_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtside_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "courtside_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "courtside_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertCourt { .. } => "insert_court",
        Command::DeactivateCourt { .. } => "deactivate_court",
        Command::SubmitRequest { .. } => "submit_request",
        Command::Checkout { .. } => "checkout",
        Command::Approve { .. } => "approve",
        Command::Reject { .. } => "reject",
        Command::CheckIn { .. } => "check_in",
        Command::Pay { .. } => "pay",
        Command::Cancel { .. } => "cancel",
        Command::SelectCourts => "select_courts",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectLineItems { .. } => "select_line_items",
        Command::SelectCart { .. } => "select_cart",
    }
}
