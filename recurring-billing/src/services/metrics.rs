//! Metrics module for recurring-billing.
//! Provides Prometheus metrics for charge jobs, reminders and store latency.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::path::Path;
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "recurring_billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Job runs counter
pub static JOB_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Processor charge attempts counter
pub static CHARGE_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Charged amount in minor units by currency
pub static CHARGED_AMOUNT_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Plans and subscriptions moved to DEFAULTED
pub static DEFAULTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Notification calls by event and outcome
pub static NOTIFICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    JOB_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "recurring_billing_job_runs_total",
                "Total job runs by job type and final status"
            ),
            &["job_type", "status"]
        )
        .expect("Failed to register JOB_RUNS_TOTAL")
    });

    CHARGE_ATTEMPTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "recurring_billing_charge_attempts_total",
                "Total processor charge attempts by plan family and outcome"
            ),
            &["plan_kind", "outcome"]
        )
        .expect("Failed to register CHARGE_ATTEMPTS_TOTAL")
    });

    CHARGED_AMOUNT_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "recurring_billing_charged_amount_minor_units_total",
                "Successfully charged amount in minor currency units"
            ),
            &["plan_kind", "currency"]
        )
        .expect("Failed to register CHARGED_AMOUNT_TOTAL")
    });

    DEFAULTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "recurring_billing_defaults_total",
                "Plans and subscriptions that reached the failure threshold"
            ),
            &["plan_kind"]
        )
        .expect("Failed to register DEFAULTS_TOTAL")
    });

    NOTIFICATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "recurring_billing_notifications_total",
                "Notification collaborator calls by event and outcome"
            ),
            &["event", "outcome"]
        )
        .expect("Failed to register NOTIFICATIONS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Write the registry to a node-exporter textfile.
///
/// Writes to a sibling temp file and renames it so the collector never reads
/// a partial file.
pub fn write_metrics_textfile(path: &Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, get_metrics())?;
    std::fs::rename(&tmp, path)
}

/// Record a finished job run.
pub fn record_job_run(job_type: &str, status: &str) {
    if let Some(counter) = JOB_RUNS_TOTAL.get() {
        counter.with_label_values(&[job_type, status]).inc();
    }
}

/// Record a processor charge attempt.
pub fn record_charge_attempt(plan_kind: &str, outcome: &str) {
    if let Some(counter) = CHARGE_ATTEMPTS_TOTAL.get() {
        counter.with_label_values(&[plan_kind, outcome]).inc();
    }
}

/// Record a successfully charged amount.
pub fn record_charged_amount(plan_kind: &str, currency: &str, amount_cents: i64) {
    if let Some(counter) = CHARGED_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[plan_kind, currency])
            .inc_by(amount_cents.unsigned_abs());
    }
}

/// Record a default transition.
pub fn record_default(plan_kind: &str) {
    if let Some(counter) = DEFAULTS_TOTAL.get() {
        counter.with_label_values(&[plan_kind]).inc();
    }
}

/// Record a notification call outcome.
pub fn record_notification(event: &str, outcome: &str) {
    if let Some(counter) = NOTIFICATIONS_TOTAL.get() {
        counter.with_label_values(&[event, outcome]).inc();
    }
}
