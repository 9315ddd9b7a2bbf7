use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tutorslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tutorslot_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings committed. Labels: path (direct, link, tutor).
pub const BOOKINGS_CREATED_TOTAL: &str = "tutorslot_bookings_created_total";

/// Counter: writes rejected by the conflict guard. Labels: kind.
pub const CONFLICTS_TOTAL: &str = "tutorslot_conflicts_total";

/// Counter: reschedule lifecycle steps. Labels: outcome.
pub const RESCHEDULE_OUTCOMES_TOTAL: &str = "tutorslot_reschedule_outcomes_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tutorslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tutorslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tutorslot_connections_rejected_total";

/// Counter: actor-scoped statements from a connection whose user is not a
/// registered ULID.
pub const AUTH_FAILURES_TOTAL: &str = "tutorslot_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tutorslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tutorslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::SaveClass { .. } => "save_class",
        Command::IssueShareLink { .. } => "issue_share_link",
        Command::SaveRule { .. } => "save_rule",
        Command::DeleteRule { .. } => "delete_rule",
        Command::SelectRules { .. } => "select_rules",
        Command::SelectBookedSlots { .. } => "select_booked_slots",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertLinkBooking { .. } => "insert_link_booking",
        Command::InsertScheduledBooking { .. } => "insert_scheduled_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::ProposeReschedule { .. } => "propose_reschedule",
        Command::DecideReschedule { .. } => "decide_reschedule",
        Command::SelectRescheduleRequests { .. } => "select_reschedule_requests",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
        Command::Checkpoint => "checkpoint",
    }
}
