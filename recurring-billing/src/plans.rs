//! Opening financing plans and subscriptions at checkout.

use crate::models::{
    FailureTracker, FinancingPlan, FinancingStatus, NewFinancingPlan, NewSubscription,
    Subscription, SubscriptionStatus,
};
use crate::schedule::build_installment_schedule;
use crate::services::BillingStore;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use tracing::{info, instrument};
use uuid::Uuid;

/// Build the installment schedule for a new financing plan and persist it.
///
/// `next_due_at` is the first installment with a non-zero amount. A plan with
/// nothing to collect is stored as PAID_OFF.
#[instrument(skip(store, input), fields(payer_id = %input.payer_id))]
pub async fn open_financing_plan(
    store: &dyn BillingStore,
    input: NewFinancingPlan,
    now: DateTime<Utc>,
) -> Result<FinancingPlan, AppError> {
    validate_currency(&input.currency)?;

    let installments = build_installment_schedule(
        input.financed_amount_cents,
        input.term_count,
        input.cadence,
        input.start_at,
    )
    .map_err(|e| AppError::BadRequest(anyhow!(e)))?;

    let next_due_at = installments
        .iter()
        .find(|i| i.amount_cents > 0)
        .map(|i| i.due_at);

    let mut plan = FinancingPlan {
        plan_id: Uuid::new_v4(),
        payer_id: input.payer_id,
        processor: input.processor,
        currency: input.currency.to_uppercase(),
        financed_amount_cents: input.financed_amount_cents,
        remaining_balance_cents: input.financed_amount_cents,
        status: FinancingStatus::Active,
        cadence: input.cadence,
        installments,
        next_due_at,
        failures: FailureTracker::default(),
        ended_at: None,
        created_at: now,
        updated_at: now,
    };
    if next_due_at.is_none() {
        plan.mark_paid_off(now);
    }

    store.create_financing_plan(&plan).await?;

    info!(
        plan_id = %plan.plan_id,
        installments = plan.installments.len(),
        financed_amount_cents = plan.financed_amount_cents,
        "Financing plan opened"
    );

    Ok(plan)
}

#[instrument(skip(store, input), fields(payer_id = %input.payer_id))]
pub async fn open_subscription(
    store: &dyn BillingStore,
    input: NewSubscription,
    now: DateTime<Utc>,
) -> Result<Subscription, AppError> {
    validate_currency(&input.currency)?;
    if input.price_cents <= 0 {
        return Err(AppError::BadRequest(anyhow!(
            "price must be positive, got {}",
            input.price_cents
        )));
    }

    let subscription = Subscription {
        subscription_id: Uuid::new_v4(),
        payer_id: input.payer_id,
        processor: input.processor,
        currency: input.currency.to_uppercase(),
        price_cents: input.price_cents,
        interval: input.interval,
        status: SubscriptionStatus::Active,
        next_charge_at: Some(input.first_charge_at),
        failures: FailureTracker::default(),
        ended_at: None,
        created_at: now,
        updated_at: now,
    };

    store.create_subscription(&subscription).await?;

    info!(
        subscription_id = %subscription.subscription_id,
        interval = subscription.interval.as_str(),
        "Subscription opened"
    );

    Ok(subscription)
}

fn validate_currency(currency: &str) -> Result<(), AppError> {
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AppError::BadRequest(anyhow!(
            "currency must be a 3-letter ISO code, got '{}'",
            currency
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cadence, ProcessorLink, RenewalInterval};
    use crate::services::InMemoryStore;
    use chrono::TimeZone;

    fn financing_input(amount: i64, terms: u32) -> NewFinancingPlan {
        NewFinancingPlan {
            payer_id: Uuid::new_v4(),
            processor: ProcessorLink::new("stripe"),
            currency: "usd".to_string(),
            financed_amount_cents: amount,
            term_count: terms,
            cadence: Cadence::Monthly,
            start_at: Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_open_financing_plan_sets_first_due_date() {
        let store = InMemoryStore::new();
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();

        let plan = open_financing_plan(&store, financing_input(10_000, 3), now)
            .await
            .unwrap();

        assert_eq!(plan.currency, "USD");
        assert_eq!(plan.remaining_balance_cents, 10_000);
        assert_eq!(
            plan.next_due_at,
            Some(Utc.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap())
        );
        let stored = store.get_financing_plan(plan.plan_id).await.unwrap();
        assert_eq!(stored, Some(plan));
    }

    #[tokio::test]
    async fn test_zero_amount_plan_opens_paid_off() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let plan = open_financing_plan(&store, financing_input(0, 3), now)
            .await
            .unwrap();

        assert_eq!(plan.status, FinancingStatus::PaidOff);
        assert_eq!(plan.next_due_at, None);
        assert_eq!(plan.ended_at, Some(now));
    }

    #[tokio::test]
    async fn test_invalid_schedule_is_bad_request() {
        let store = InMemoryStore::new();

        let err = open_financing_plan(&store, financing_input(10_000, 0), Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_open_subscription_rejects_bad_currency() {
        let store = InMemoryStore::new();
        let input = NewSubscription {
            payer_id: Uuid::new_v4(),
            processor: ProcessorLink::new("stripe"),
            currency: "dollars".to_string(),
            price_cents: 999,
            interval: RenewalInterval::Monthly,
            first_charge_at: Utc::now(),
        };

        let err = open_subscription(&store, input, Utc::now()).await.unwrap_err();

        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_open_subscription_rejects_free_price() {
        let store = InMemoryStore::new();
        let input = NewSubscription {
            payer_id: Uuid::new_v4(),
            processor: ProcessorLink::new("stripe"),
            currency: "USD".to_string(),
            price_cents: 0,
            interval: RenewalInterval::Monthly,
            first_charge_at: Utc::now(),
        };

        let err = open_subscription(&store, input, Utc::now()).await.unwrap_err();

        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
