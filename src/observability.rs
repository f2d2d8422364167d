use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "parkd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "parkd_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservations created. Labels: booking.
pub const RESERVATIONS_CREATED_TOTAL: &str = "parkd_reservations_created_total";

/// Counter: reservation attempts lost to an overlapping claim.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "parkd_reservation_conflicts_total";

/// Counter: pending reservations cancelled after the grace period.
pub const EXPIRED_CANCELLED_TOTAL: &str = "parkd_expired_cancelled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkd_connections_rejected_total";

/// Gauge: number of active campuses (loaded engines).
pub const CAMPUSES_ACTIVE: &str = "parkd_campuses_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSite { .. } => "insert_site",
        Command::InsertBuilding { .. } => "insert_building",
        Command::InsertSchedule { .. } => "insert_schedule",
        Command::InsertSlot { .. } => "insert_slot",
        Command::BatchInsertSlots { .. } => "batch_insert_slots",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservationStatus { .. } => "update_reservation_status",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectSites => "select_sites",
        Command::SelectBuildings { .. } => "select_buildings",
        Command::SelectSchedules { .. } => "select_schedules",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectZones { .. } => "select_zones",
        Command::SelectWindows { .. } => "select_windows",
        Command::SelectQuotes { .. } => "select_quotes",
        Command::SelectOccupied { .. } => "select_occupied",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
