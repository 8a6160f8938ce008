use super::{JobContext, JobReport, JobRunTracker};
use crate::calendar::utc_day_bounds;
use crate::models::{
    FinancingPlan, JobType, NotificationEvent, NotificationType, PlanKind, ReminderCounters,
    Subscription,
};
use crate::services::metrics;
use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use tracing::{info, warn};

/// Send an upcoming-charge reminder for everything due on the UTC day that is
/// `reminder_days_before` days from `now`.
///
/// Delivery is at most once per item, due date and lead time; the notifier
/// dedupes on that key, so re-running the job on the same day is harmless.
pub async fn send_reminders(
    ctx: &JobContext,
    now: DateTime<Utc>,
) -> Result<JobReport<ReminderCounters>, AppError> {
    let mut counters = ReminderCounters::default();
    let tracker = JobRunTracker::start(
        ctx.store.as_ref(),
        JobType::SendReminders,
        ctx.correlation_id.as_deref(),
        &counters,
    )
    .await?;

    let days_before = ctx.settings.reminder_days_before;
    let target_day = match Duration::try_days(days_before).and_then(|d| now.checked_add_signed(d))
    {
        Some(day) => day,
        None => {
            let e = AppError::ConfigError(anyhow!(
                "reminder lead time of {} days is out of range",
                days_before
            ));
            tracker.fail(&e, &counters).await;
            return Err(e);
        }
    };
    let (start, end) = utc_day_bounds(target_day);

    let due = async {
        let plans = ctx.store.find_financing_plans_due_between(start, end).await?;
        let subscriptions = ctx
            .store
            .find_subscriptions_due_between(start, end)
            .await?;
        Ok::<_, AppError>((plans, subscriptions))
    };
    let (plans, subscriptions) = match due.await {
        Ok(due) => due,
        Err(e) => {
            tracker.fail(&e, &counters).await;
            return Err(e);
        }
    };

    info!(
        window_start = %start,
        window_end = %end,
        financing_plans = plans.len(),
        subscriptions = subscriptions.len(),
        "Sending upcoming charge reminders"
    );

    let days_before = i32::try_from(days_before).unwrap_or(i32::MAX);
    let events = plans
        .iter()
        .filter_map(|plan| financing_reminder(plan, days_before))
        .chain(
            subscriptions
                .iter()
                .filter_map(|subscription| subscription_reminder(subscription, days_before)),
        );

    for event in events {
        counters.processed += 1;
        deliver(ctx, &event, &mut counters).await;
        tracker.record_progress(&counters).await;
    }

    let run_id = tracker.run_id();
    tracker.complete(&counters).await?;

    Ok(JobReport { run_id, counters })
}

async fn deliver(ctx: &JobContext, event: &NotificationEvent, counters: &mut ReminderCounters) {
    let event_name = event.notification_type.as_str();
    match ctx.notifier.notify(event).await {
        Ok(outcome) if outcome.is_failure() => {
            counters.failed += 1;
            metrics::record_notification(event_name, outcome.label());
            warn!(
                entity_id = %event.entity_id,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "Reminder not delivered"
            );
        }
        Ok(outcome) => {
            if outcome.skipped {
                counters.skipped += 1;
            } else {
                counters.sent += 1;
            }
            metrics::record_notification(event_name, outcome.label());
        }
        Err(e) => {
            counters.failed += 1;
            metrics::record_notification(event_name, "error");
            warn!(entity_id = %event.entity_id, error = %e, "Reminder request failed");
        }
    }
}

fn financing_reminder(plan: &FinancingPlan, days_before: i32) -> Option<NotificationEvent> {
    let due_at = plan.next_due_at?;
    let amount_cents = plan
        .installments
        .iter()
        .find(|i| i.due_at == due_at)
        .map(|i| i.amount_cents.min(plan.remaining_balance_cents));

    Some(NotificationEvent {
        notification_type: NotificationType::UpcomingCharge,
        family: PlanKind::Financing,
        entity_id: plan.plan_id,
        payer_id: plan.payer_id,
        scheduled_for: due_at,
        days_before: Some(days_before),
        amount_cents,
        currency: plan.currency.clone(),
        failure_message: None,
    })
}

fn subscription_reminder(
    subscription: &Subscription,
    days_before: i32,
) -> Option<NotificationEvent> {
    Some(NotificationEvent {
        notification_type: NotificationType::UpcomingCharge,
        family: PlanKind::Subscription,
        entity_id: subscription.subscription_id,
        payer_id: subscription.payer_id,
        scheduled_for: subscription.next_charge_at?,
        days_before: Some(days_before),
        amount_cents: Some(subscription.price_cents),
        currency: subscription.currency.clone(),
        failure_message: None,
    })
}
