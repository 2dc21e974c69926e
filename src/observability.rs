use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: service operations. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "venuebook_operations_total";

/// Histogram: service operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "venuebook_operation_duration_seconds";

/// Counter: bookings refused for lack of capacity.
pub const CAPACITY_REJECTIONS_TOTAL: &str = "venuebook_capacity_rejections_total";

/// Counter: guest-list submissions routed into a preview session.
pub const PREVIEWS_CREATED_TOTAL: &str = "venuebook_previews_created_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open preview sessions.
pub const PREVIEW_SESSIONS_ACTIVE: &str = "venuebook_preview_sessions_active";

/// Counter: notifications published. Labels: kind.
pub const NOTIFICATIONS_TOTAL: &str = "venuebook_notifications_total";

/// Counter: notifications the outbound sink failed to deliver.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "venuebook_notification_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "venuebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (operations per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "venuebook_wal_flush_batch_size";

/// Counter: WAL compactions run by the background task.
pub const WAL_COMPACTIONS_TOTAL: &str = "venuebook_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for the outcome of an operation.
pub fn status_label<T>(result: &Result<T, EngineError>) -> &'static str {
    use crate::engine::ErrorKind;
    match result {
        Ok(_) => "ok",
        Err(e) => match e.kind() {
            ErrorKind::Validation => "invalid",
            ErrorKind::Authorization => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "unavailable",
        },
    }
}

/// Record count, latency and, for capacity refusals, the rejection counter.
pub fn record<T>(op: &'static str, started: std::time::Instant, result: &Result<T, EngineError>) {
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status_label(result)).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    if let Err(EngineError::CapacityExceeded { .. }) = result {
        metrics::counter!(CAPACITY_REJECTIONS_TOTAL).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_follow_error_kind() {
        let ok: Result<(), EngineError> = Ok(());
        assert_eq!(status_label(&ok), "ok");
        let err: Result<(), EngineError> = Err(EngineError::Timeout("waiting"));
        assert_eq!(status_label(&err), "unavailable");
        let err: Result<(), EngineError> = Err(EngineError::LimitRequired);
        assert_eq!(status_label(&err), "invalid");
    }
}
