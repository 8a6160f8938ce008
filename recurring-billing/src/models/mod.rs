//! Domain models for recurring-billing.

mod job_run;
mod notification;
mod payment_attempt;
mod plan;
mod subscription;

pub use job_run::{ChargeCounters, JobRun, JobRunStatus, JobType, ReminderCounters};
pub use notification::{NotificationDedupeKey, NotificationEvent, NotificationType};
pub use payment_attempt::{
    idempotency_key, AttemptResolution, AttemptStatus, AttemptType, NewPaymentAttempt,
    PaymentAttempt, PlanKind,
};
pub use plan::{
    Cadence, FailureTracker, FinancingPlan, FinancingStatus, Installment, NewFinancingPlan,
    ProcessorLink, DEFAULT_FAILURE_THRESHOLD,
};
pub use subscription::{NewSubscription, RenewalInterval, Subscription, SubscriptionStatus};
