use super::charge::{
    charge_failed_event, defaulted_event, execute_charge, notify_best_effort, resolve_context,
    ChargeTarget,
};
use super::{JobContext, JobReport, JobRunTracker};
use crate::calendar::{add_months_clamped, same_utc_day};
use crate::ledger::{DateState, PaymentLedger};
use crate::models::{AttemptType, ChargeCounters, JobType, PlanKind, Subscription};
use crate::services::metrics;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use tracing::{error, info, info_span, warn, Instrument};

/// Renew every ACTIVE subscription whose `next_charge_at` has passed.
///
/// At most one charge per subscription per run. The charge date advances by
/// the renewal interval whether the charge succeeded or failed; a subscription
/// that already failed today is left until tomorrow.
pub async fn charge_subscriptions(
    ctx: &JobContext,
    now: DateTime<Utc>,
) -> Result<JobReport<ChargeCounters>, AppError> {
    let mut counters = ChargeCounters::default();
    let tracker = JobRunTracker::start(
        ctx.store.as_ref(),
        JobType::ChargeSubscriptions,
        ctx.correlation_id.as_deref(),
        &counters,
    )
    .await?;

    let subscriptions = match ctx.store.find_due_subscriptions(now).await {
        Ok(subscriptions) => subscriptions,
        Err(e) => {
            tracker.fail(&e, &counters).await;
            return Err(e);
        }
    };

    info!(
        due_subscriptions = subscriptions.len(),
        "Charging due subscriptions"
    );

    for subscription in subscriptions {
        counters.processed += 1;
        let subscription_id = subscription.subscription_id;
        let span = info_span!("subscription", subscription_id = %subscription_id);
        if let Err(e) = process_subscription(ctx, subscription, now, &mut counters)
            .instrument(span)
            .await
        {
            counters.errors += 1;
            error!(
                subscription_id = %subscription_id,
                error = %e,
                "Failed to process subscription"
            );
        }
        tracker.record_progress(&counters).await;
    }

    let run_id = tracker.run_id();
    tracker.complete(&counters).await?;

    Ok(JobReport { run_id, counters })
}

async fn process_subscription(
    ctx: &JobContext,
    mut subscription: Subscription,
    now: DateTime<Utc>,
    counters: &mut ChargeCounters,
) -> Result<(), AppError> {
    let Some(scheduled_for) = subscription.next_charge_at else {
        counters.skipped += 1;
        return Ok(());
    };

    let Some(handler) = ctx.processors.get(&subscription.processor.processor) else {
        warn!(
            processor = %subscription.processor.processor,
            "Unsupported processor, skipping subscription"
        );
        counters.skipped += 1;
        return Ok(());
    };

    if subscription
        .failures
        .last_failed_at
        .is_some_and(|failed_at| same_utc_day(failed_at, now))
    {
        info!("Charge already failed today, retrying tomorrow");
        counters.skipped += 1;
        return Ok(());
    }

    let attempts = ctx
        .store
        .list_payment_attempts(PlanKind::Subscription, subscription.subscription_id)
        .await?;
    let ledger = PaymentLedger::from_attempts(attempts, ctx.stale_pending_before(now)?);
    let following = add_months_clamped(scheduled_for, subscription.interval.months());

    if subscription.price_cents == 0 {
        info!(
            scheduled_for = %scheduled_for,
            next_charge_at = %following,
            "Free renewal, advancing charge date without charging"
        );
        subscription.next_charge_at = Some(following);
        ctx.store.update_subscription(&subscription).await?;
        counters.skipped += 1;
        return Ok(());
    }

    match ledger.state(scheduled_for) {
        DateState::Paid => {
            // Charged by a run that stopped before saving the subscription.
            info!(
                scheduled_for = %scheduled_for,
                next_charge_at = %following,
                "Renewal already paid, advancing charge date"
            );
            subscription.next_charge_at = Some(following);
            subscription.failures.record_success();
            ctx.store.update_subscription(&subscription).await?;
            counters.skipped += 1;
            return Ok(());
        }
        DateState::Pending => {
            info!(
                scheduled_for = %scheduled_for,
                "Renewal has an unresolved PENDING attempt, leaving it"
            );
            counters.skipped += 1;
            return Ok(());
        }
        DateState::Open => {}
    }

    let context =
        match resolve_context(handler, subscription.payer_id, &mut subscription.processor).await {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "No usable processor context, skipping subscription");
                counters.errors += 1;
                return Ok(());
            }
        };

    let result = execute_charge(
        ctx.store.as_ref(),
        handler,
        &context,
        ChargeTarget {
            plan_kind: PlanKind::Subscription,
            plan_id: subscription.subscription_id,
            payer_id: subscription.payer_id,
            attempt_type: AttemptType::Renewal,
            scheduled_for,
            amount_cents: subscription.price_cents,
            currency: &subscription.currency,
        },
    )
    .await?;

    if result.is_unresolved() {
        // The PENDING attempt blocks this date until it is reconciled.
        counters.errors += 1;
        ctx.store.update_subscription(&subscription).await?;
        return Ok(());
    }

    if result.succeeded() {
        subscription.failures.record_success();
        counters.charged += 1;
    } else {
        counters.failed += 1;
        let defaulted = subscription
            .failures
            .record_failure(now, ctx.settings.failure_threshold);
        notify_best_effort(
            ctx.notifier.as_ref(),
            charge_failed_event(
                PlanKind::Subscription,
                subscription.subscription_id,
                subscription.payer_id,
                scheduled_for,
                subscription.price_cents,
                &subscription.currency,
                result.failure_message(),
            ),
        )
        .await;

        if defaulted {
            subscription.mark_defaulted(now);
            counters.defaulted += 1;
            metrics::record_default(PlanKind::Subscription.as_str());
            warn!(
                failed_attempt_count = subscription.failures.failed_attempt_count,
                "Subscription defaulted"
            );
            notify_best_effort(
                ctx.notifier.as_ref(),
                defaulted_event(
                    PlanKind::Subscription,
                    subscription.subscription_id,
                    subscription.payer_id,
                    scheduled_for,
                    &subscription.currency,
                    result.failure_message(),
                ),
            )
            .await;
        }
    }

    if subscription.is_active() {
        subscription.next_charge_at = Some(following);
    }
    ctx.store.update_subscription(&subscription).await?;

    Ok(())
}
