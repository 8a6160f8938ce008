//! PostgreSQL-backed `BillingStore`.

use super::metrics::DB_QUERY_DURATION;
use super::store::BillingStore;
use crate::models::{
    AttemptResolution, AttemptStatus, AttemptType, Cadence, FailureTracker, FinancingPlan,
    FinancingStatus, Installment, JobRun, JobRunStatus, JobType, NewPaymentAttempt,
    NotificationDedupeKey, PaymentAttempt, PlanKind, ProcessorLink, RenewalInterval,
    Subscription, SubscriptionStatus,
};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const FINANCING_COLUMNS: &str = "plan_id, payer_id, processor, processor_customer_id, processor_payment_method_id, currency, financed_amount_cents, remaining_balance_cents, status, cadence, installments, next_due_at, failed_attempt_count, last_failed_at, ended_at, created_utc, updated_utc";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, payer_id, processor, processor_customer_id, processor_payment_method_id, currency, price_cents, renewal_interval, status, next_charge_at, failed_attempt_count, last_failed_at, ended_at, created_utc, updated_utc";

const ATTEMPT_COLUMNS: &str = "attempt_id, plan_kind, plan_id, attempt_type, status, amount_cents, currency, scheduled_for, idempotency_key, processor_payment_id, failure_message, created_utc, updated_utc";

const JOB_RUN_COLUMNS: &str = "run_id, job_type, status, started_utc, completed_utc, progress, summary, error_message, correlation_id";

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow!("{}: {}", context, e))
}

fn unknown_value(column: &str, value: &str) -> AppError {
    AppError::DatabaseError(anyhow!("unknown {} value '{}'", column, value))
}

#[derive(Debug, FromRow)]
struct FinancingPlanRow {
    plan_id: Uuid,
    payer_id: Uuid,
    processor: String,
    processor_customer_id: Option<String>,
    processor_payment_method_id: Option<String>,
    currency: String,
    financed_amount_cents: i64,
    remaining_balance_cents: i64,
    status: String,
    cadence: String,
    installments: Json<Vec<Installment>>,
    next_due_at: Option<DateTime<Utc>>,
    failed_attempt_count: i32,
    last_failed_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<FinancingPlanRow> for FinancingPlan {
    type Error = AppError;

    fn try_from(row: FinancingPlanRow) -> Result<Self, Self::Error> {
        Ok(FinancingPlan {
            plan_id: row.plan_id,
            payer_id: row.payer_id,
            processor: ProcessorLink {
                processor: row.processor,
                customer_id: row.processor_customer_id,
                payment_method_id: row.processor_payment_method_id,
            },
            currency: row.currency,
            financed_amount_cents: row.financed_amount_cents,
            remaining_balance_cents: row.remaining_balance_cents,
            status: FinancingStatus::from_string(&row.status)
                .ok_or_else(|| unknown_value("financing status", &row.status))?,
            cadence: Cadence::from_string(&row.cadence)
                .ok_or_else(|| unknown_value("cadence", &row.cadence))?,
            installments: row.installments.0,
            next_due_at: row.next_due_at,
            failures: FailureTracker {
                failed_attempt_count: row.failed_attempt_count,
                last_failed_at: row.last_failed_at,
            },
            ended_at: row.ended_at,
            created_at: row.created_utc,
            updated_at: row.updated_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    subscription_id: Uuid,
    payer_id: Uuid,
    processor: String,
    processor_customer_id: Option<String>,
    processor_payment_method_id: Option<String>,
    currency: String,
    price_cents: i64,
    renewal_interval: String,
    status: String,
    next_charge_at: Option<DateTime<Utc>>,
    failed_attempt_count: i32,
    last_failed_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = AppError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            subscription_id: row.subscription_id,
            payer_id: row.payer_id,
            processor: ProcessorLink {
                processor: row.processor,
                customer_id: row.processor_customer_id,
                payment_method_id: row.processor_payment_method_id,
            },
            currency: row.currency,
            price_cents: row.price_cents,
            interval: RenewalInterval::from_string(&row.renewal_interval)
                .ok_or_else(|| unknown_value("renewal interval", &row.renewal_interval))?,
            status: SubscriptionStatus::from_string(&row.status)
                .ok_or_else(|| unknown_value("subscription status", &row.status))?,
            next_charge_at: row.next_charge_at,
            failures: FailureTracker {
                failed_attempt_count: row.failed_attempt_count,
                last_failed_at: row.last_failed_at,
            },
            ended_at: row.ended_at,
            created_at: row.created_utc,
            updated_at: row.updated_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct PaymentAttemptRow {
    attempt_id: Uuid,
    plan_kind: String,
    plan_id: Uuid,
    attempt_type: String,
    status: String,
    amount_cents: i64,
    currency: String,
    scheduled_for: DateTime<Utc>,
    idempotency_key: String,
    processor_payment_id: Option<String>,
    failure_message: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<PaymentAttemptRow> for PaymentAttempt {
    type Error = AppError;

    fn try_from(row: PaymentAttemptRow) -> Result<Self, Self::Error> {
        Ok(PaymentAttempt {
            attempt_id: row.attempt_id,
            plan_kind: PlanKind::from_string(&row.plan_kind)
                .ok_or_else(|| unknown_value("plan kind", &row.plan_kind))?,
            plan_id: row.plan_id,
            attempt_type: AttemptType::from_string(&row.attempt_type)
                .ok_or_else(|| unknown_value("attempt type", &row.attempt_type))?,
            status: AttemptStatus::from_string(&row.status)
                .ok_or_else(|| unknown_value("attempt status", &row.status))?,
            amount_cents: row.amount_cents,
            currency: row.currency,
            scheduled_for: row.scheduled_for,
            idempotency_key: row.idempotency_key,
            processor_payment_id: row.processor_payment_id,
            failure_message: row.failure_message,
            created_at: row.created_utc,
            updated_at: row.updated_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct JobRunRow {
    run_id: Uuid,
    job_type: String,
    status: String,
    started_utc: DateTime<Utc>,
    completed_utc: Option<DateTime<Utc>>,
    progress: serde_json::Value,
    summary: Option<serde_json::Value>,
    error_message: Option<String>,
    correlation_id: Option<String>,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = AppError;

    fn try_from(row: JobRunRow) -> Result<Self, Self::Error> {
        Ok(JobRun {
            run_id: row.run_id,
            job_type: JobType::from_string(&row.job_type)
                .ok_or_else(|| unknown_value("job type", &row.job_type))?,
            status: JobRunStatus::from_string(&row.status)
                .ok_or_else(|| unknown_value("job run status", &row.status))?,
            started_at: row.started_utc,
            completed_at: row.completed_utc,
            progress: row.progress,
            summary: row.summary,
            error: row.error_message,
            correlation_id: row.correlation_id,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, AppError>
where
    T: TryFrom<R, Error = AppError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "recurring-billing"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database connectivity.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_financing_plans(
        &self,
        operation: &str,
        query: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<FinancingPlan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let mut q = sqlx::query_as::<_, FinancingPlanRow>(query).bind(start);
        if let Some(end) = end {
            q = q.bind(end);
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error(operation, e))?;

        timer.observe_duration();

        convert_all(rows)
    }

    async fn fetch_subscriptions(
        &self,
        operation: &str,
        query: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let mut q = sqlx::query_as::<_, SubscriptionRow>(query).bind(start);
        if let Some(end) = end {
            q = q.bind(end);
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error(operation, e))?;

        timer.observe_duration();

        convert_all(rows)
    }
}

#[async_trait]
impl BillingStore for Database {
    // =========================================================================
    // Financing Plans
    // =========================================================================

    #[instrument(skip(self, plan), fields(plan_id = %plan.plan_id))]
    async fn create_financing_plan(&self, plan: &FinancingPlan) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_financing_plan"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO financing_plans (plan_id, payer_id, processor, processor_customer_id, processor_payment_method_id, currency, financed_amount_cents, remaining_balance_cents, status, cadence, installments, next_due_at, failed_attempt_count, last_failed_at, ended_at, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(plan.plan_id)
        .bind(plan.payer_id)
        .bind(&plan.processor.processor)
        .bind(&plan.processor.customer_id)
        .bind(&plan.processor.payment_method_id)
        .bind(&plan.currency)
        .bind(plan.financed_amount_cents)
        .bind(plan.remaining_balance_cents)
        .bind(plan.status.as_str())
        .bind(plan.cadence.as_str())
        .bind(Json(&plan.installments))
        .bind(plan.next_due_at)
        .bind(plan.failures.failed_attempt_count)
        .bind(plan.failures.last_failed_at)
        .bind(plan.ended_at)
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create financing plan", e))?;

        timer.observe_duration();
        info!(plan_id = %plan.plan_id, "Financing plan created");

        Ok(())
    }

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn get_financing_plan(&self, plan_id: Uuid) -> Result<Option<FinancingPlan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_financing_plan"])
            .start_timer();

        let row = sqlx::query_as::<_, FinancingPlanRow>(&format!(
            "SELECT {} FROM financing_plans WHERE plan_id = $1",
            FINANCING_COLUMNS
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get financing plan", e))?;

        timer.observe_duration();

        row.map(FinancingPlan::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn find_due_financing_plans(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FinancingPlan>, AppError> {
        let query = format!(
            r#"
            SELECT {}
            FROM financing_plans
            WHERE status = 'active'
              AND next_due_at <= $1
            ORDER BY next_due_at ASC, plan_id ASC
            "#,
            FINANCING_COLUMNS
        );
        self.fetch_financing_plans("find_due_financing_plans", &query, now, None)
            .await
    }

    #[instrument(skip(self))]
    async fn find_financing_plans_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FinancingPlan>, AppError> {
        let query = format!(
            r#"
            SELECT {}
            FROM financing_plans
            WHERE status = 'active'
              AND next_due_at >= $1
              AND next_due_at < $2
            ORDER BY next_due_at ASC, plan_id ASC
            "#,
            FINANCING_COLUMNS
        );
        self.fetch_financing_plans("find_financing_plans_due_between", &query, start, Some(end))
            .await
    }

    #[instrument(skip(self, plan), fields(plan_id = %plan.plan_id))]
    async fn update_financing_plan(&self, plan: &FinancingPlan) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_financing_plan"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE financing_plans
            SET processor_customer_id = $2, processor_payment_method_id = $3, remaining_balance_cents = $4, status = $5, next_due_at = $6, failed_attempt_count = $7, last_failed_at = $8, ended_at = $9, updated_utc = NOW()
            WHERE plan_id = $1
            "#,
        )
        .bind(plan.plan_id)
        .bind(&plan.processor.customer_id)
        .bind(&plan.processor.payment_method_id)
        .bind(plan.remaining_balance_cents)
        .bind(plan.status.as_str())
        .bind(plan.next_due_at)
        .bind(plan.failures.failed_attempt_count)
        .bind(plan.failures.last_failed_at)
        .bind(plan.ended_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update financing plan", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow!("financing plan {}", plan.plan_id)));
        }
        Ok(())
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO subscriptions (subscription_id, payer_id, processor, processor_customer_id, processor_payment_method_id, currency, price_cents, renewal_interval, status, next_charge_at, failed_attempt_count, last_failed_at, ended_at, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(subscription.payer_id)
        .bind(&subscription.processor.processor)
        .bind(&subscription.processor.customer_id)
        .bind(&subscription.processor.payment_method_id)
        .bind(&subscription.currency)
        .bind(subscription.price_cents)
        .bind(subscription.interval.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.next_charge_at)
        .bind(subscription.failures.failed_attempt_count)
        .bind(subscription.failures.last_failed_at)
        .bind(subscription.ended_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create subscription", e))?;

        timer.observe_duration();
        info!(subscription_id = %subscription.subscription_id, "Subscription created");

        Ok(())
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get subscription", e))?;

        timer.observe_duration();

        row.map(Subscription::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn find_due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        let query = format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE status = 'active'
              AND next_charge_at <= $1
            ORDER BY next_charge_at ASC, subscription_id ASC
            "#,
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_subscriptions("find_due_subscriptions", &query, now, None)
            .await
    }

    #[instrument(skip(self))]
    async fn find_subscriptions_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        let query = format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE status = 'active'
              AND next_charge_at >= $1
              AND next_charge_at < $2
            ORDER BY next_charge_at ASC, subscription_id ASC
            "#,
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_subscriptions("find_subscriptions_due_between", &query, start, Some(end))
            .await
    }

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET processor_customer_id = $2, processor_payment_method_id = $3, status = $4, next_charge_at = $5, failed_attempt_count = $6, last_failed_at = $7, ended_at = $8, updated_utc = NOW()
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(&subscription.processor.customer_id)
        .bind(&subscription.processor.payment_method_id)
        .bind(subscription.status.as_str())
        .bind(subscription.next_charge_at)
        .bind(subscription.failures.failed_attempt_count)
        .bind(subscription.failures.last_failed_at)
        .bind(subscription.ended_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update subscription", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow!(
                "subscription {}",
                subscription.subscription_id
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Payment Attempts
    // =========================================================================

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn list_payment_attempts(
        &self,
        plan_kind: PlanKind,
        plan_id: Uuid,
    ) -> Result<Vec<PaymentAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payment_attempts"])
            .start_timer();

        let rows = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            r#"
            SELECT {}
            FROM payment_attempts
            WHERE plan_kind = $1 AND plan_id = $2
            ORDER BY created_utc ASC, attempt_id ASC
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(plan_kind.as_str())
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list payment attempts", e))?;

        timer.observe_duration();

        convert_all(rows)
    }

    #[instrument(skip(self, input), fields(plan_id = %input.plan_id, scheduled_for = %input.scheduled_for))]
    async fn create_payment_attempt(
        &self,
        input: &NewPaymentAttempt,
    ) -> Result<PaymentAttempt, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_payment_attempt"])
            .start_timer();

        let row = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            r#"
            INSERT INTO payment_attempts (attempt_id, plan_kind, plan_id, attempt_type, status, amount_cents, currency, scheduled_for, idempotency_key)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8)
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.plan_kind.as_str())
        .bind(input.plan_id)
        .bind(input.attempt_type.as_str())
        .bind(input.amount_cents)
        .bind(&input.currency)
        .bind(input.scheduled_for)
        .bind(&input.idempotency_key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create payment attempt", e))?;

        timer.observe_duration();

        PaymentAttempt::try_from(row)
    }

    #[instrument(skip(self, resolution), fields(attempt_id = %attempt_id))]
    async fn resolve_payment_attempt(
        &self,
        attempt_id: Uuid,
        resolution: &AttemptResolution,
    ) -> Result<PaymentAttempt, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["resolve_payment_attempt"])
            .start_timer();

        let (processor_payment_id, failure_message) = match resolution {
            AttemptResolution::Succeeded {
                processor_payment_id,
            } => (Some(processor_payment_id.as_str()), None),
            AttemptResolution::Failed { failure_message } => {
                (None, Some(failure_message.as_str()))
            }
        };

        let row = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            r#"
            UPDATE payment_attempts
            SET status = $2, processor_payment_id = COALESCE($3, processor_payment_id), failure_message = COALESCE($4, failure_message), updated_utc = clock_timestamp()
            WHERE attempt_id = $1
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(attempt_id)
        .bind(resolution.status().as_str())
        .bind(processor_payment_id)
        .bind(failure_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to resolve payment attempt", e))?;

        timer.observe_duration();

        row.map(PaymentAttempt::try_from)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(anyhow!("payment attempt {}", attempt_id)))
    }

    // =========================================================================
    // Job Runs
    // =========================================================================

    #[instrument(skip(self, progress))]
    async fn create_job_run(
        &self,
        job_type: JobType,
        progress: &serde_json::Value,
        correlation_id: Option<&str>,
    ) -> Result<JobRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_job_run"])
            .start_timer();

        let row = sqlx::query_as::<_, JobRunRow>(&format!(
            r#"
            INSERT INTO job_runs (run_id, job_type, status, progress, correlation_id)
            VALUES ($1, $2, 'running', $3, $4)
            RETURNING {}
            "#,
            JOB_RUN_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(job_type.as_str())
        .bind(progress)
        .bind(correlation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create job run", e))?;

        timer.observe_duration();

        JobRun::try_from(row)
    }

    #[instrument(skip(self, progress), fields(run_id = %run_id))]
    async fn update_job_run_progress(
        &self,
        run_id: Uuid,
        progress: &serde_json::Value,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_job_run_progress"])
            .start_timer();

        sqlx::query("UPDATE job_runs SET progress = $2 WHERE run_id = $1")
            .bind(run_id)
            .bind(progress)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to update job run progress", e))?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self, summary), fields(run_id = %run_id))]
    async fn finish_job_run(
        &self,
        run_id: Uuid,
        status: JobRunStatus,
        summary: &serde_json::Value,
        error: Option<&str>,
    ) -> Result<JobRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finish_job_run"])
            .start_timer();

        let row = sqlx::query_as::<_, JobRunRow>(&format!(
            r#"
            UPDATE job_runs
            SET status = $2, completed_utc = NOW(), progress = $3, summary = $3, error_message = $4
            WHERE run_id = $1
            RETURNING {}
            "#,
            JOB_RUN_COLUMNS
        ))
        .bind(run_id)
        .bind(status.as_str())
        .bind(summary)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to finish job run", e))?;

        timer.observe_duration();

        row.map(JobRun::try_from)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(anyhow!("job run {}", run_id)))
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_job_run(&self, run_id: Uuid) -> Result<Option<JobRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_job_run"])
            .start_timer();

        let row = sqlx::query_as::<_, JobRunRow>(&format!(
            "SELECT {} FROM job_runs WHERE run_id = $1",
            JOB_RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get job run", e))?;

        timer.observe_duration();

        row.map(JobRun::try_from).transpose()
    }

    // =========================================================================
    // Notification Dedupe
    // =========================================================================

    #[instrument(skip(self, key), fields(entity_id = %key.entity_id))]
    async fn insert_notification_dedupe(
        &self,
        key: &NotificationDedupeKey,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_notification_dedupe"])
            .start_timer();

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO notification_dedupe (notification_type, entity_type, entity_id, scheduled_for, days_before)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            RETURNING entity_id
            "#,
        )
        .bind(key.notification_type.as_str())
        .bind(key.entity_type.as_str())
        .bind(key.entity_id)
        .bind(key.scheduled_for)
        .bind(key.days_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert notification dedupe", e))?;

        timer.observe_duration();

        Ok(inserted.is_some())
    }

    #[instrument(skip(self, key), fields(entity_id = %key.entity_id))]
    async fn delete_notification_dedupe(
        &self,
        key: &NotificationDedupeKey,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_notification_dedupe"])
            .start_timer();

        sqlx::query(
            r#"
            DELETE FROM notification_dedupe
            WHERE notification_type = $1 AND entity_type = $2 AND entity_id = $3 AND scheduled_for = $4 AND days_before = $5
            "#,
        )
        .bind(key.notification_type.as_str())
        .bind(key.entity_type.as_str())
        .bind(key.entity_id)
        .bind(key.scheduled_for)
        .bind(key.days_before)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to delete notification dedupe", e))?;

        timer.observe_duration();

        Ok(())
    }
}
