use super::charge::{
    charge_failed_event, defaulted_event, execute_charge, notify_best_effort, resolve_context,
    ChargeTarget,
};
use super::{JobContext, JobReport, JobRunTracker};
use crate::ledger::{DateState, PaymentLedger};
use crate::models::{
    AttemptType, ChargeCounters, FinancingPlan, Installment, JobType, PlanKind,
};
use crate::services::metrics;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use tracing::{error, info, info_span, warn, Instrument};

/// Charge every due installment of every ACTIVE financing plan.
///
/// Installments of one plan are charged in due order until the plan is paid
/// off or defaults. A declined installment does not stop later ones from being
/// tried in the same run.
pub async fn charge_financing_plans(
    ctx: &JobContext,
    now: DateTime<Utc>,
) -> Result<JobReport<ChargeCounters>, AppError> {
    let mut counters = ChargeCounters::default();
    let tracker = JobRunTracker::start(
        ctx.store.as_ref(),
        JobType::ChargeFinancing,
        ctx.correlation_id.as_deref(),
        &counters,
    )
    .await?;

    let plans = match ctx.store.find_due_financing_plans(now).await {
        Ok(plans) => plans,
        Err(e) => {
            tracker.fail(&e, &counters).await;
            return Err(e);
        }
    };

    info!(due_plans = plans.len(), "Charging due financing plans");

    for plan in plans {
        counters.processed += 1;
        let plan_id = plan.plan_id;
        let span = info_span!("financing_plan", plan_id = %plan_id);
        if let Err(e) = process_plan(ctx, plan, now, &mut counters)
            .instrument(span)
            .await
        {
            counters.errors += 1;
            error!(plan_id = %plan_id, error = %e, "Failed to process financing plan");
        }
        tracker.record_progress(&counters).await;
    }

    let run_id = tracker.run_id();
    tracker.complete(&counters).await?;

    Ok(JobReport { run_id, counters })
}

async fn process_plan(
    ctx: &JobContext,
    mut plan: FinancingPlan,
    now: DateTime<Utc>,
    counters: &mut ChargeCounters,
) -> Result<(), AppError> {
    let Some(handler) = ctx.processors.get(&plan.processor.processor) else {
        warn!(
            processor = %plan.processor.processor,
            "Unsupported processor, skipping plan"
        );
        counters.skipped += 1;
        return Ok(());
    };

    let original = plan.clone();
    let attempts = ctx
        .store
        .list_payment_attempts(PlanKind::Financing, plan.plan_id)
        .await?;
    let mut ledger = PaymentLedger::from_attempts(attempts, ctx.stale_pending_before(now)?);

    let due: Vec<Installment> = plan.due_installments(now).cloned().collect();
    let mut context = None;
    let mut attempted = 0u32;

    for installment in due {
        if !plan.is_active() || plan.remaining_balance_cents == 0 {
            break;
        }
        if installment.amount_cents == 0 {
            continue;
        }
        match ledger.state(installment.due_at) {
            DateState::Paid => continue,
            DateState::Pending => {
                info!(
                    due_at = %installment.due_at,
                    "Installment has an unresolved PENDING attempt, leaving it"
                );
                continue;
            }
            DateState::Open => {}
        }

        if context.is_none() {
            match resolve_context(handler, plan.payer_id, &mut plan.processor).await {
                Ok(resolved) => context = Some(resolved),
                Err(e) => {
                    warn!(error = %e, "No usable processor context, skipping plan");
                    counters.errors += 1;
                    return Ok(());
                }
            }
        }
        let Some(processor_context) = context.as_ref() else {
            break;
        };

        let amount_cents = installment.amount_cents.min(plan.remaining_balance_cents);
        let result = execute_charge(
            ctx.store.as_ref(),
            handler,
            processor_context,
            ChargeTarget {
                plan_kind: PlanKind::Financing,
                plan_id: plan.plan_id,
                payer_id: plan.payer_id,
                attempt_type: AttemptType::Installment,
                scheduled_for: installment.due_at,
                amount_cents,
                currency: &plan.currency,
            },
        )
        .await;
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                // Keep what earlier installments in this run already settled.
                if plan != original {
                    if let Err(update_err) = ctx.store.update_financing_plan(&plan).await {
                        error!(error = %update_err, "Failed to save partially charged plan");
                    }
                }
                return Err(e);
            }
        };
        attempted += 1;

        if result.is_unresolved() {
            counters.errors += 1;
        } else if result.succeeded() {
            plan.apply_payment(amount_cents);
            counters.charged += 1;
        } else {
            counters.failed += 1;
            let defaulted = plan
                .failures
                .record_failure(now, ctx.settings.failure_threshold);
            notify_best_effort(
                ctx.notifier.as_ref(),
                charge_failed_event(
                    PlanKind::Financing,
                    plan.plan_id,
                    plan.payer_id,
                    installment.due_at,
                    amount_cents,
                    &plan.currency,
                    result.failure_message(),
                ),
            )
            .await;

            if defaulted {
                plan.mark_defaulted(now);
                counters.defaulted += 1;
                metrics::record_default(PlanKind::Financing.as_str());
                warn!(
                    failed_attempt_count = plan.failures.failed_attempt_count,
                    "Financing plan defaulted"
                );
                notify_best_effort(
                    ctx.notifier.as_ref(),
                    defaulted_event(
                        PlanKind::Financing,
                        plan.plan_id,
                        plan.payer_id,
                        installment.due_at,
                        &plan.currency,
                        result.failure_message(),
                    ),
                )
                .await;
            }
        }
        ledger.record(result.attempt);
    }

    if plan.is_active() {
        settle_schedule(&mut plan, &ledger, now, counters);
    }

    if attempted == 0 {
        counters.skipped += 1;
    }

    if plan != original {
        ctx.store.update_financing_plan(&plan).await?;
    }

    Ok(())
}

/// Move `next_due_at` to the earliest unpaid installment, or close the plan
/// when nothing is left to collect.
fn settle_schedule(
    plan: &mut FinancingPlan,
    ledger: &PaymentLedger,
    now: DateTime<Utc>,
    counters: &mut ChargeCounters,
) {
    let next_unpaid = plan
        .installments
        .iter()
        .filter(|i| i.amount_cents > 0)
        .find(|i| !ledger.is_paid(i.due_at))
        .map(|i| i.due_at);

    if plan.remaining_balance_cents == 0 || next_unpaid.is_none() {
        if plan.remaining_balance_cents > 0 {
            warn!(
                remaining_balance_cents = plan.remaining_balance_cents,
                "Every installment paid but balance remains, closing plan"
            );
        }
        plan.mark_paid_off(now);
        counters.paid_off += 1;
        info!("Financing plan paid off");
    } else {
        plan.next_due_at = next_unpaid;
    }
}
