use std::fmt;
use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "packslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "packslot_query_duration_seconds";

/// Counter: booking creates/updates/cancels refused. Labels: reason.
pub const BOOKINGS_REJECTED: &str = "packslot_bookings_rejected_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "packslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "packslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "packslot_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "packslot_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "packslot_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "packslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "packslot_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "packslot_wal_compactions_total";

#[derive(Debug)]
pub struct MetricsError(String);

impl fmt::Display for MetricsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to install Prometheus metrics exporter: {}", self.0)
    }
}

impl std::error::Error for MetricsError {}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), MetricsError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError(e.to_string()))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertGrower { .. } => "insert_grower",
        Command::InsertCredential { .. } => "insert_credential",
        Command::SelectGrowers => "select_growers",
        Command::InsertCultivar { .. } => "insert_cultivar",
        Command::SelectCultivars => "select_cultivars",
        Command::InsertSlot { .. } => "insert_slot",
        Command::UpdateSlot { .. } => "update_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectSlotRange { .. } => "select_slot_range",
        Command::SelectSlot { .. } => "select_slot",
        Command::SelectSlotUsage { .. } => "select_slot_usage",
        Command::InsertSlotSeries(_) => "insert_slot_series",
        Command::InsertBlackout { .. } => "insert_blackout",
        Command::InsertBulkBlackout { .. } => "insert_bulk_blackout",
        Command::InsertRestrictions { .. } => "insert_restrictions",
        Command::DeleteRestrictions { .. } => "delete_restrictions",
        Command::SelectRestrictions { .. } => "select_restrictions",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectNextAvailable { .. } => "select_next_available",
        Command::InsertTemplate { .. } => "insert_template",
        Command::UpdateTemplate { .. } => "update_template",
        Command::DeleteTemplate { .. } => "delete_template",
        Command::SelectTemplates => "select_templates",
        Command::SelectTemplate { .. } => "select_template",
        Command::SelectTemplatePlan { .. } => "select_template_plan",
        Command::InsertTemplatePublication { .. } => "insert_template_publication",
        Command::SelectExport { csv: false, .. } => "select_bookings_export",
        Command::SelectExport { csv: true, .. } => "select_bookings_csv",
        Command::InsertConsignment(_) => "insert_consignment",
        Command::SelectConsignments { .. } => "select_consignments",
        Command::InsertCheckpoint { .. } => "insert_checkpoint",
        Command::SelectCheckpoints { .. } => "select_checkpoints",
        Command::SelectDomainEvents { .. } => "select_domain_events",
        Command::SelectWhoami => "select_whoami",
        Command::SelectHealth => "select_health",
    }
}
