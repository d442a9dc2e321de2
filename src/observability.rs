use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservation attempts. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "castslot_reservations_total";

/// Histogram: end-to-end reservation latency in seconds. Labels: outcome.
pub const RESERVATION_DURATION_SECONDS: &str = "castslot_reservation_duration_seconds";

/// Histogram: slots covered by an accepted reservation.
pub const RESERVATION_SLOTS: &str = "castslot_reservation_slots";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: time spent acquiring slot row locks, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "castslot_lock_wait_seconds";

/// Counter: lock acquisitions abandoned at the lock-wait timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "castslot_lock_timeouts_total";

/// Counter: read-through cache misses. Labels: family.
pub const CACHE_MISSES_TOTAL: &str = "castslot_cache_misses_total";

/// Counter: explicit cache invalidations that removed an entry. Labels: family.
pub const CACHE_INVALIDATIONS_TOTAL: &str = "castslot_cache_invalidations_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "castslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "castslot_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "castslot_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
