//! Persistence seam for the billing jobs.
//!
//! `Database` backs this with PostgreSQL; `InMemoryStore` backs it with a
//! mutex-guarded map for tests and local dry runs.

use crate::models::{
    AttemptResolution, FinancingPlan, JobRun, JobRunStatus, JobType, NewPaymentAttempt,
    NotificationDedupeKey, PaymentAttempt, PlanKind, Subscription,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Financing plans

    async fn create_financing_plan(&self, plan: &FinancingPlan) -> Result<(), AppError>;

    async fn get_financing_plan(&self, plan_id: Uuid) -> Result<Option<FinancingPlan>, AppError>;

    /// ACTIVE plans with `next_due_at <= now`, earliest due first.
    async fn find_due_financing_plans(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FinancingPlan>, AppError>;

    /// ACTIVE plans with `start <= next_due_at < end`.
    async fn find_financing_plans_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FinancingPlan>, AppError>;

    /// Persist the mutable state of a plan (status, balance, due date, failures,
    /// cached processor references).
    async fn update_financing_plan(&self, plan: &FinancingPlan) -> Result<(), AppError>;

    // Subscriptions

    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), AppError>;

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError>;

    /// ACTIVE subscriptions with `next_charge_at <= now`, earliest due first.
    async fn find_due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError>;

    /// ACTIVE subscriptions with `start <= next_charge_at < end`.
    async fn find_subscriptions_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError>;

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), AppError>;

    // Payment attempts

    /// Every attempt for a plan, in creation order.
    async fn list_payment_attempts(
        &self,
        plan_kind: PlanKind,
        plan_id: Uuid,
    ) -> Result<Vec<PaymentAttempt>, AppError>;

    /// Record a PENDING attempt.
    async fn create_payment_attempt(
        &self,
        input: &NewPaymentAttempt,
    ) -> Result<PaymentAttempt, AppError>;

    /// Move a PENDING attempt to SUCCEEDED or FAILED.
    async fn resolve_payment_attempt(
        &self,
        attempt_id: Uuid,
        resolution: &AttemptResolution,
    ) -> Result<PaymentAttempt, AppError>;

    // Job runs

    async fn create_job_run(
        &self,
        job_type: JobType,
        progress: &serde_json::Value,
        correlation_id: Option<&str>,
    ) -> Result<JobRun, AppError>;

    async fn update_job_run_progress(
        &self,
        run_id: Uuid,
        progress: &serde_json::Value,
    ) -> Result<(), AppError>;

    /// Stamp `completed_at` and move the run to COMPLETED or FAILED.
    async fn finish_job_run(
        &self,
        run_id: Uuid,
        status: JobRunStatus,
        summary: &serde_json::Value,
        error: Option<&str>,
    ) -> Result<JobRun, AppError>;

    async fn get_job_run(&self, run_id: Uuid) -> Result<Option<JobRun>, AppError>;

    // Notification dedupe

    /// Claim a notification. `Ok(false)` means it was already claimed.
    async fn insert_notification_dedupe(
        &self,
        key: &NotificationDedupeKey,
    ) -> Result<bool, AppError>;

    /// Release a claim whose delivery failed so a later run can retry it.
    async fn delete_notification_dedupe(&self, key: &NotificationDedupeKey)
        -> Result<(), AppError>;
}
