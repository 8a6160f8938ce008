//! Charge executor shared by the financing and subscription jobs.

use crate::models::{
    idempotency_key, AttemptResolution, AttemptType, NewPaymentAttempt, NotificationEvent,
    NotificationType, PaymentAttempt, PlanKind, ProcessorLink,
};
use crate::services::{
    metrics, BillingStore, ChargeOutcome, ChargeRequest, ContextRequest, Notifier,
    ProcessorContext, ProcessorError, ProcessorHandler,
};
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One scheduled date to charge.
pub(crate) struct ChargeTarget<'a> {
    pub plan_kind: PlanKind,
    pub plan_id: Uuid,
    pub payer_id: Uuid,
    pub attempt_type: AttemptType,
    pub scheduled_for: DateTime<Utc>,
    pub amount_cents: i64,
    pub currency: &'a str,
}

pub(crate) struct ChargeResult {
    pub attempt: PaymentAttempt,
    /// `None` when the processor could not tell whether the charge happened;
    /// the attempt is then still PENDING.
    pub outcome: Option<ChargeOutcome>,
}

impl ChargeResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Some(ChargeOutcome::Succeeded { .. }))
    }

    pub fn is_unresolved(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn failure_message(&self) -> Option<&str> {
        match &self.outcome {
            Some(ChargeOutcome::Failed { error }) => Some(error.as_str()),
            _ => None,
        }
    }
}

/// Processor metadata for a charge. Built from values that are the same for
/// every attempt at one scheduled date, since the processor rejects a reused
/// idempotency key sent with different parameters.
fn charge_metadata(target: &ChargeTarget<'_>) -> HashMap<String, String> {
    HashMap::from([
        ("plan_kind".to_string(), target.plan_kind.as_str().to_string()),
        ("plan_id".to_string(), target.plan_id.to_string()),
        ("payer_id".to_string(), target.payer_id.to_string()),
        ("scheduled_for".to_string(), target.scheduled_for.to_rfc3339()),
    ])
}

/// Resolve the customer and payment method, caching newly found references
/// back onto the plan's processor link.
pub(crate) async fn resolve_context(
    handler: &dyn ProcessorHandler,
    payer_id: Uuid,
    link: &mut ProcessorLink,
) -> Result<ProcessorContext, ProcessorError> {
    let context = handler
        .resolve_context(&ContextRequest {
            payer_id,
            customer_id: link.customer_id.clone(),
            payment_method_id: link.payment_method_id.clone(),
        })
        .await?;

    link.customer_id = Some(context.customer_id.clone());
    link.payment_method_id = Some(context.payment_method_id.clone());
    Ok(context)
}

/// Record a PENDING attempt, charge, then resolve the attempt.
///
/// Processor errors are folded into a FAILED attempt, except an idempotency
/// conflict, which leaves the attempt PENDING so its date stays blocked. Only
/// store errors are returned.
pub(crate) async fn execute_charge(
    store: &dyn BillingStore,
    handler: &dyn ProcessorHandler,
    context: &ProcessorContext,
    target: ChargeTarget<'_>,
) -> Result<ChargeResult, AppError> {
    let key = idempotency_key(target.plan_kind, target.plan_id, target.scheduled_for);

    let pending = store
        .create_payment_attempt(&NewPaymentAttempt {
            plan_kind: target.plan_kind,
            plan_id: target.plan_id,
            attempt_type: target.attempt_type,
            amount_cents: target.amount_cents,
            currency: target.currency.to_string(),
            scheduled_for: target.scheduled_for,
            idempotency_key: key.clone(),
        })
        .await?;

    let request = ChargeRequest {
        customer_id: context.customer_id.clone(),
        payment_method_id: context.payment_method_id.clone(),
        amount_cents: target.amount_cents,
        currency: target.currency.to_string(),
        idempotency_key: key,
        metadata: charge_metadata(&target),
    };

    let kind = target.plan_kind.as_str();
    let outcome = match handler.charge(&request).await {
        Ok(outcome) => outcome,
        Err(ProcessorError::IdempotencyConflict(key)) => {
            metrics::record_charge_attempt(kind, "unresolved");
            error!(
                plan_id = %target.plan_id,
                attempt_id = %pending.attempt_id,
                scheduled_for = %target.scheduled_for,
                idempotency_key = %key,
                "Charge outcome unknown, leaving attempt PENDING"
            );
            return Ok(ChargeResult {
                attempt: pending,
                outcome: None,
            });
        }
        Err(e) => {
            warn!(
                plan_id = %target.plan_id,
                attempt_id = %pending.attempt_id,
                error = %e,
                "Processor charge errored"
            );
            ChargeOutcome::Failed {
                error: e.to_string(),
            }
        }
    };

    let resolution = match &outcome {
        ChargeOutcome::Succeeded {
            processor_payment_id,
        } => AttemptResolution::Succeeded {
            processor_payment_id: processor_payment_id.clone(),
        },
        ChargeOutcome::Failed { error } => AttemptResolution::Failed {
            failure_message: error.clone(),
        },
    };
    let attempt = store
        .resolve_payment_attempt(pending.attempt_id, &resolution)
        .await?;

    match &outcome {
        ChargeOutcome::Succeeded {
            processor_payment_id,
        } => {
            metrics::record_charge_attempt(kind, "succeeded");
            metrics::record_charged_amount(kind, target.currency, target.amount_cents);
            info!(
                plan_id = %target.plan_id,
                scheduled_for = %target.scheduled_for,
                amount_cents = target.amount_cents,
                processor_payment_id = %processor_payment_id,
                "Charge succeeded"
            );
        }
        ChargeOutcome::Failed { error } => {
            metrics::record_charge_attempt(kind, "failed");
            warn!(
                plan_id = %target.plan_id,
                scheduled_for = %target.scheduled_for,
                amount_cents = target.amount_cents,
                error = %error,
                "Charge failed"
            );
        }
    }

    Ok(ChargeResult {
        attempt,
        outcome: Some(outcome),
    })
}

/// Deliver a notification; failures are logged and counted, never returned.
pub(crate) async fn notify_best_effort(notifier: &dyn Notifier, event: NotificationEvent) {
    let event_name = event.notification_type.as_str();
    match notifier.notify(&event).await {
        Ok(outcome) => {
            metrics::record_notification(event_name, outcome.label());
            if outcome.is_failure() {
                warn!(
                    event = event_name,
                    entity_id = %event.entity_id,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "Notification not delivered"
                );
            }
        }
        Err(e) => {
            metrics::record_notification(event_name, "error");
            warn!(
                event = event_name,
                entity_id = %event.entity_id,
                error = %e,
                "Notification request failed"
            );
        }
    }
}

/// Event for a declined or errored charge.
pub(crate) fn charge_failed_event(
    plan_kind: PlanKind,
    entity_id: Uuid,
    payer_id: Uuid,
    scheduled_for: DateTime<Utc>,
    amount_cents: i64,
    currency: &str,
    failure_message: Option<&str>,
) -> NotificationEvent {
    NotificationEvent {
        notification_type: NotificationType::ChargeFailed,
        family: plan_kind,
        entity_id,
        payer_id,
        scheduled_for,
        days_before: None,
        amount_cents: Some(amount_cents),
        currency: currency.to_string(),
        failure_message: failure_message.map(str::to_string),
    }
}

/// Event for a plan or subscription that just defaulted.
pub(crate) fn defaulted_event(
    plan_kind: PlanKind,
    entity_id: Uuid,
    payer_id: Uuid,
    scheduled_for: DateTime<Utc>,
    currency: &str,
    failure_message: Option<&str>,
) -> NotificationEvent {
    NotificationEvent {
        notification_type: NotificationType::Defaulted,
        family: plan_kind,
        entity_id,
        payer_id,
        scheduled_for,
        days_before: None,
        amount_cents: None,
        currency: currency.to_string(),
        failure_message: failure_message.map(str::to_string),
    }
}
