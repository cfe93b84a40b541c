//! Prometheus Metrics for bqlink
//!
//! Exports metrics for:
//! - Query submissions and their latency
//! - Backend selection decisions
//! - Rows filled into buffers and rows delivered to callers
//! - Open cursors

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, register_int_gauge,
    CounterVec, Encoder, Histogram, HistogramVec, IntGauge, TextEncoder,
};

// ═══════════════════════════════════════════════════════════════════════════
// SUBMISSION METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Query submissions by outcome
pub static QUERIES_SUBMITTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bqlink_queries_submitted_total",
        "Total queries submitted by outcome",
        &["status"]
    )
    .unwrap()
});

/// Time spent waiting for query submission
pub static SUBMISSION_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "bqlink_submission_latency_seconds",
        "Query submission latency in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════
// CURSOR METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Backend chosen per cursor
pub static BACKEND_SELECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bqlink_backend_selected_total",
        "Cursors created by selected backend and reason",
        &["backend", "reason"]
    )
    .unwrap()
});

/// Rows moved into cursor buffers
pub static ROWS_FILLED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bqlink_rows_filled_total",
        "Rows appended to read-ahead buffers by backend",
        &["backend"]
    )
    .unwrap()
});

/// Rows handed to callers by `next()`
pub static ROWS_DELIVERED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "bqlink_rows_delivered_total",
        "Rows returned to callers by backend",
        &["backend"]
    )
    .unwrap()
});

/// Duration of a single backend fill
pub static FILL_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "bqlink_fill_duration_seconds",
        "Backend fill duration in seconds",
        &["backend", "status"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap()
});

/// Cursors currently holding backend resources
pub static ACTIVE_CURSORS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("bqlink_active_cursors", "Number of open result cursors").unwrap()
});

/// Render all registered metrics in Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_submission(status: &str, duration_secs: f64) {
    QUERIES_SUBMITTED_TOTAL.with_label_values(&[status]).inc();
    SUBMISSION_LATENCY_SECONDS.observe(duration_secs);
}

pub fn record_backend_selected(backend: &str, reason: &str) {
    BACKEND_SELECTED_TOTAL
        .with_label_values(&[backend, reason])
        .inc();
}

pub fn record_fill(backend: &str, status: &str, rows: usize, duration_secs: f64) {
    FILL_DURATION_SECONDS
        .with_label_values(&[backend, status])
        .observe(duration_secs);
    if rows > 0 {
        ROWS_FILLED_TOTAL
            .with_label_values(&[backend])
            .inc_by(rows as f64);
    }
}

pub fn record_row_delivered(backend: &str) {
    ROWS_DELIVERED_TOTAL.with_label_values(&[backend]).inc();
}

pub fn cursor_opened() {
    ACTIVE_CURSORS.inc();
}

pub fn cursor_released() {
    ACTIVE_CURSORS.dec();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_recorded_metrics() {
        record_backend_selected("paged", "empty_first_page");
        record_fill("paged", "ok", 3, 0.002);
        let text = encode_metrics();
        assert!(text.contains("bqlink_backend_selected_total"));
        assert!(text.contains("bqlink_rows_filled_total"));
    }

    #[test]
    fn test_delivered_rows_counted_per_backend() {
        let before = ROWS_DELIVERED_TOTAL.with_label_values(&["streaming"]).get();
        record_row_delivered("streaming");
        record_row_delivered("streaming");
        let after = ROWS_DELIVERED_TOTAL.with_label_values(&["streaming"]).get();
        assert!(after >= before + 2.0);
    }
}
