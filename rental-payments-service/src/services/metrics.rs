//! Prometheus metrics for rental-payments-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Payment status transitions by resulting status and trigger.
pub static PAYMENT_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payments_transitions_total",
        "Total number of payment status transitions",
        &["to_status", "trigger"]
    )
    .expect("Failed to register payments_transitions_total")
});

/// Webhook events by event type and outcome.
pub static WEBHOOK_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payments_webhook_events_total",
        "Total number of provider webhook events by outcome",
        &["event_type", "outcome"] // processed, duplicate, ignored, failed, rejected
    )
    .expect("Failed to register payments_webhook_events_total")
});

/// Provider calls by operation and result.
pub static PROVIDER_CALLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payments_provider_calls_total",
        "Total number of invoice provider calls",
        &["operation", "result"]
    )
    .expect("Failed to register payments_provider_calls_total")
});

/// Provider call latency by operation.
pub static PROVIDER_CALL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "payments_provider_call_duration_seconds",
        "Invoice provider call duration in seconds",
        &["operation"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register payments_provider_call_duration")
});

/// Amount recorded in cents by transaction type and currency.
pub static TRANSACTION_AMOUNT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payments_transaction_amount_cents_total",
        "Total transaction amount in cents",
        &["type", "currency"]
    )
    .expect("Failed to register payments_transaction_amount_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "payments_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register payments_errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "payments_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register payments_db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&PAYMENT_TRANSITIONS_TOTAL);
    Lazy::force(&WEBHOOK_EVENTS_TOTAL);
    Lazy::force(&PROVIDER_CALLS_TOTAL);
    Lazy::force(&PROVIDER_CALL_DURATION);
    Lazy::force(&TRANSACTION_AMOUNT_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
