//! Process bootstrap shared by the job binaries.

use crate::config::BillingJobsConfig;
use crate::jobs::{charge_financing_plans, charge_subscriptions, send_reminders, JobContext};
use crate::services::{
    init_metrics, write_metrics_textfile, BillingStore, Database, HttpNotifier, LedgerNotifier,
    Notifier, ProcessorRegistry, StripeProcessor,
};
use chrono::Utc;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::observability::{init_tracing, shutdown_tracing};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    ChargeFinancing,
    ChargeSubscriptions,
    SendReminders,
}

impl Job {
    pub fn as_str(&self) -> &'static str {
        match self {
            Job::ChargeFinancing => "charge-financing",
            Job::ChargeSubscriptions => "charge-subscriptions",
            Job::SendReminders => "send-reminders",
        }
    }
}

/// Load configuration, run `job` once and report the exit status.
pub async fn run(job: Job) -> ExitCode {
    let config = match BillingJobsConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );
    init_metrics();

    let correlation_id = Uuid::new_v4().to_string();
    let span = info_span!("job", job = job.as_str(), correlation_id = %correlation_id);

    let result = execute(job, &config, correlation_id).instrument(span).await;

    if let Some(path) = &config.metrics_textfile_path {
        if let Err(e) = write_metrics_textfile(path) {
            warn!(path = %path.display(), error = %e, "Failed to write metrics textfile");
        }
    }

    let code = match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(job = job.as_str(), error_kind = e.kind(), error = %e, "Job failed");
            ExitCode::FAILURE
        }
    };

    shutdown_tracing();
    code
}

async fn execute(
    job: Job,
    config: &BillingJobsConfig,
    correlation_id: String,
) -> Result<(), AppError> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.common.environment,
        db_max_connections = config.database.max_connections,
        notification_service_url = %config.notifications.url,
        notification_dedupe_local = config.notifications.dedupe_locally,
        reminder_days_before = config.jobs.reminder_days_before,
        failure_threshold = config.jobs.failure_threshold,
        "Starting {}",
        job.as_str()
    );

    let ctx = build_context(config, &correlation_id).await?;
    let now = Utc::now();

    match job {
        Job::ChargeFinancing => {
            let report = charge_financing_plans(&ctx, now).await?;
            info!(run_id = %report.run_id, counters = ?report.counters, "Financing charge run finished");
        }
        Job::ChargeSubscriptions => {
            let report = charge_subscriptions(&ctx, now).await?;
            info!(run_id = %report.run_id, counters = ?report.counters, "Subscription charge run finished");
        }
        Job::SendReminders => {
            let report = send_reminders(&ctx, now).await?;
            info!(run_id = %report.run_id, counters = ?report.counters, "Reminder run finished");
        }
    }

    Ok(())
}

async fn build_context(
    config: &BillingJobsConfig,
    correlation_id: &str,
) -> Result<JobContext, AppError> {
    let db = Database::new(
        config.database.url.expose_secret(),
        config.database.max_connections,
        config.database.min_connections,
    )
    .await?;
    db.health_check().await?;
    db.run_migrations().await?;
    let store: Arc<dyn BillingStore> = Arc::new(db);

    let stripe = StripeProcessor::new(config.stripe.clone())
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Stripe client: {}", e)))?;
    if !stripe.is_configured() {
        if config.common.is_production() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "STRIPE_SECRET_KEY must be set in production"
            )));
        }
        warn!("STRIPE_SECRET_KEY is not set, Stripe charges will fail");
    }
    let processors = ProcessorRegistry::new().with_handler(Arc::new(stripe));

    let http = HttpNotifier::new(config.notifications.clone())
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("notification client: {}", e)))?
        .with_correlation_id(correlation_id);
    let notifier: Arc<dyn Notifier> = if config.notifications.dedupe_locally {
        Arc::new(LedgerNotifier::new(store.clone(), http))
    } else {
        Arc::new(http)
    };

    Ok(
        JobContext::new(store, processors, notifier, config.jobs.clone())
            .with_correlation_id(correlation_id),
    )
}
