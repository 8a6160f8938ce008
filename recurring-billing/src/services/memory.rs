//! In-memory `BillingStore` for tests and local dry runs.

use super::store::BillingStore;
use crate::models::{
    AttemptResolution, AttemptStatus, FinancingPlan, JobRun, JobRunStatus, JobType,
    NewPaymentAttempt, NotificationDedupeKey, PaymentAttempt, PlanKind, Subscription,
};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    financing_plans: HashMap<Uuid, FinancingPlan>,
    subscriptions: HashMap<Uuid, Subscription>,
    attempts: Vec<PaymentAttempt>,
    job_runs: HashMap<Uuid, JobRun>,
    dedupe: HashSet<NotificationDedupeKey>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    fail_due_queries: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every due-item query fail, to exercise job-level failure handling.
    pub fn set_fail_due_queries(&self, fail: bool) {
        self.fail_due_queries.store(fail, Ordering::SeqCst);
    }

    /// All attempts across plans, in creation order.
    pub fn payment_attempts(&self) -> Vec<PaymentAttempt> {
        self.lock().map(|s| s.attempts.clone()).unwrap_or_default()
    }

    pub fn job_runs(&self) -> Vec<JobRun> {
        let mut runs: Vec<JobRun> = self
            .lock()
            .map(|s| s.job_runs.values().cloned().collect())
            .unwrap_or_default();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    /// Insert an attempt as-is, e.g. one left PENDING by a crashed run.
    pub fn seed_payment_attempt(&self, attempt: PaymentAttempt) -> Result<(), AppError> {
        self.lock()?.attempts.push(attempt);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::InternalError(anyhow!("in-memory store lock poisoned")))
    }

    fn check_due_queries(&self) -> Result<(), AppError> {
        if self.fail_due_queries.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow!(
                "due-item query unavailable"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingStore for InMemoryStore {
    async fn create_financing_plan(&self, plan: &FinancingPlan) -> Result<(), AppError> {
        let mut state = self.lock()?;
        if state.financing_plans.contains_key(&plan.plan_id) {
            return Err(AppError::Conflict(anyhow!(
                "financing plan {} already exists",
                plan.plan_id
            )));
        }
        state.financing_plans.insert(plan.plan_id, plan.clone());
        Ok(())
    }

    async fn get_financing_plan(&self, plan_id: Uuid) -> Result<Option<FinancingPlan>, AppError> {
        Ok(self.lock()?.financing_plans.get(&plan_id).cloned())
    }

    async fn find_due_financing_plans(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FinancingPlan>, AppError> {
        self.check_due_queries()?;
        let mut plans: Vec<FinancingPlan> = self
            .lock()?
            .financing_plans
            .values()
            .filter(|p| p.is_active() && p.next_due_at.is_some_and(|d| d <= now))
            .cloned()
            .collect();
        plans.sort_by_key(|p| (p.next_due_at, p.plan_id));
        Ok(plans)
    }

    async fn find_financing_plans_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FinancingPlan>, AppError> {
        self.check_due_queries()?;
        let mut plans: Vec<FinancingPlan> = self
            .lock()?
            .financing_plans
            .values()
            .filter(|p| {
                p.is_active() && p.next_due_at.is_some_and(|d| start <= d && d < end)
            })
            .cloned()
            .collect();
        plans.sort_by_key(|p| (p.next_due_at, p.plan_id));
        Ok(plans)
    }

    async fn update_financing_plan(&self, plan: &FinancingPlan) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let stored = state
            .financing_plans
            .get_mut(&plan.plan_id)
            .ok_or_else(|| AppError::NotFound(anyhow!("financing plan {}", plan.plan_id)))?;
        *stored = FinancingPlan {
            updated_at: Utc::now(),
            ..plan.clone()
        };
        Ok(())
    }

    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), AppError> {
        let mut state = self.lock()?;
        if state
            .subscriptions
            .contains_key(&subscription.subscription_id)
        {
            return Err(AppError::Conflict(anyhow!(
                "subscription {} already exists",
                subscription.subscription_id
            )));
        }
        state
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self.lock()?.subscriptions.get(&subscription_id).cloned())
    }

    async fn find_due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        self.check_due_queries()?;
        let mut subscriptions: Vec<Subscription> = self
            .lock()?
            .subscriptions
            .values()
            .filter(|s| s.is_active() && s.next_charge_at.is_some_and(|d| d <= now))
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| (s.next_charge_at, s.subscription_id));
        Ok(subscriptions)
    }

    async fn find_subscriptions_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, AppError> {
        self.check_due_queries()?;
        let mut subscriptions: Vec<Subscription> = self
            .lock()?
            .subscriptions
            .values()
            .filter(|s| {
                s.is_active() && s.next_charge_at.is_some_and(|d| start <= d && d < end)
            })
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| (s.next_charge_at, s.subscription_id));
        Ok(subscriptions)
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let stored = state
            .subscriptions
            .get_mut(&subscription.subscription_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow!("subscription {}", subscription.subscription_id))
            })?;
        *stored = Subscription {
            updated_at: Utc::now(),
            ..subscription.clone()
        };
        Ok(())
    }

    async fn list_payment_attempts(
        &self,
        plan_kind: PlanKind,
        plan_id: Uuid,
    ) -> Result<Vec<PaymentAttempt>, AppError> {
        Ok(self
            .lock()?
            .attempts
            .iter()
            .filter(|a| a.plan_kind == plan_kind && a.plan_id == plan_id)
            .cloned()
            .collect())
    }

    async fn create_payment_attempt(
        &self,
        input: &NewPaymentAttempt,
    ) -> Result<PaymentAttempt, AppError> {
        let now = Utc::now();
        let attempt = PaymentAttempt {
            attempt_id: Uuid::new_v4(),
            plan_kind: input.plan_kind,
            plan_id: input.plan_id,
            attempt_type: input.attempt_type,
            status: AttemptStatus::Pending,
            amount_cents: input.amount_cents,
            currency: input.currency.clone(),
            scheduled_for: input.scheduled_for,
            idempotency_key: input.idempotency_key.clone(),
            processor_payment_id: None,
            failure_message: None,
            created_at: now,
            updated_at: now,
        };
        self.lock()?.attempts.push(attempt.clone());
        Ok(attempt)
    }

    async fn resolve_payment_attempt(
        &self,
        attempt_id: Uuid,
        resolution: &AttemptResolution,
    ) -> Result<PaymentAttempt, AppError> {
        let mut state = self.lock()?;
        let attempt = state
            .attempts
            .iter_mut()
            .find(|a| a.attempt_id == attempt_id)
            .ok_or_else(|| AppError::NotFound(anyhow!("payment attempt {}", attempt_id)))?;

        attempt.status = resolution.status();
        match resolution {
            AttemptResolution::Succeeded {
                processor_payment_id,
            } => attempt.processor_payment_id = Some(processor_payment_id.clone()),
            AttemptResolution::Failed { failure_message } => {
                attempt.failure_message = Some(failure_message.clone())
            }
        }
        attempt.updated_at = Utc::now();
        Ok(attempt.clone())
    }

    async fn create_job_run(
        &self,
        job_type: JobType,
        progress: &serde_json::Value,
        correlation_id: Option<&str>,
    ) -> Result<JobRun, AppError> {
        let run = JobRun {
            run_id: Uuid::new_v4(),
            job_type,
            status: JobRunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            progress: progress.clone(),
            summary: None,
            error: None,
            correlation_id: correlation_id.map(str::to_string),
        };
        self.lock()?.job_runs.insert(run.run_id, run.clone());
        Ok(run)
    }

    async fn update_job_run_progress(
        &self,
        run_id: Uuid,
        progress: &serde_json::Value,
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let run = state
            .job_runs
            .get_mut(&run_id)
            .ok_or_else(|| AppError::NotFound(anyhow!("job run {}", run_id)))?;
        run.progress = progress.clone();
        Ok(())
    }

    async fn finish_job_run(
        &self,
        run_id: Uuid,
        status: JobRunStatus,
        summary: &serde_json::Value,
        error: Option<&str>,
    ) -> Result<JobRun, AppError> {
        let mut state = self.lock()?;
        let run = state
            .job_runs
            .get_mut(&run_id)
            .ok_or_else(|| AppError::NotFound(anyhow!("job run {}", run_id)))?;
        run.status = status;
        run.completed_at = Some(Utc::now());
        run.progress = summary.clone();
        run.summary = Some(summary.clone());
        run.error = error.map(str::to_string);
        Ok(run.clone())
    }

    async fn get_job_run(&self, run_id: Uuid) -> Result<Option<JobRun>, AppError> {
        Ok(self.lock()?.job_runs.get(&run_id).cloned())
    }

    async fn insert_notification_dedupe(
        &self,
        key: &NotificationDedupeKey,
    ) -> Result<bool, AppError> {
        Ok(self.lock()?.dedupe.insert(key.clone()))
    }

    async fn delete_notification_dedupe(
        &self,
        key: &NotificationDedupeKey,
    ) -> Result<(), AppError> {
        self.lock()?.dedupe.remove(key);
        Ok(())
    }
}
