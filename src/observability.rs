use std::net::SocketAddr;

// ── pipeline metrics ─────────────────────────────────────────────

/// Counter: expiry notices delivered and marked PROCESSED.
pub const NOTICES_SENT_TOTAL: &str = "stowage_notices_sent_total";

/// Counter: delivery failures marked FAILED (dispatch and retry runs).
pub const NOTICES_FAILED_TOTAL: &str = "stowage_notices_failed_total";

/// Counter: notices abandoned after exhausting retries.
pub const NOTICES_ABANDONED_TOTAL: &str = "stowage_notices_abandoned_total";

/// Counter: dispatch trigger firings skipped because a run was in flight.
pub const DISPATCH_RUNS_SKIPPED_TOTAL: &str = "stowage_dispatch_runs_skipped_total";

/// Counter: retry trigger firings skipped because a run was in flight.
pub const RETRY_RUNS_SKIPPED_TOTAL: &str = "stowage_retry_runs_skipped_total";

// ── allocation metrics ───────────────────────────────────────────

/// Counter: bookings allocated.
pub const BOOKINGS_ALLOCATED_TOTAL: &str = "stowage_bookings_allocated_total";

/// Counter: allocations lost to a concurrent racer.
pub const ALLOCATION_CONFLICTS_TOTAL: &str = "stowage_allocation_conflicts_total";

/// Gauge: bookings currently active.
pub const BOOKINGS_ACTIVE: &str = "stowage_bookings_active";

/// Gauge: storage units registered.
pub const UNITS_TOTAL: &str = "stowage_units_total";

// ── durability metrics ───────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stowage_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "stowage_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "stowage_wal_compactions_total";

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
