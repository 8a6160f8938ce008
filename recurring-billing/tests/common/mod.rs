//! Test helpers for recurring-billing job tests.
//!
//! Jobs run against `InMemoryStore` with a scripted processor and a notifier
//! that records every event it is handed.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use recurring_billing::config::JobSettings;
use recurring_billing::jobs::JobContext;
use recurring_billing::models::{
    Cadence, FinancingPlan, NewFinancingPlan, NewSubscription, NotificationEvent, ProcessorLink,
    RenewalInterval, Subscription,
};
use recurring_billing::plans::{open_financing_plan, open_subscription};
use recurring_billing::services::{
    ChargeOutcome, ChargeRequest, ContextRequest, InMemoryStore, NotificationOutcome, Notifier,
    NotifyError, ProcessorContext, ProcessorError, ProcessorHandler, ProcessorRegistry,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const FAKE_PROCESSOR: &str = "stripe";

pub fn utc(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

/// Processor whose charge outcomes are scripted in order. Once the script runs
/// out every charge succeeds.
#[derive(Default)]
pub struct FakeProcessor {
    script: Mutex<VecDeque<Result<ChargeOutcome, ProcessorError>>>,
    charges: Mutex<Vec<ChargeRequest>>,
    context_lookups: Mutex<Vec<ContextRequest>>,
    context_unavailable: Mutex<bool>,
}

impl FakeProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_decline(&self, message: &str) {
        self.script.lock().unwrap().push_back(Ok(ChargeOutcome::Failed {
            error: message.to_string(),
        }));
    }

    pub fn push_declines(&self, count: usize) {
        for _ in 0..count {
            self.push_decline("card_declined: Your card was declined.");
        }
    }

    pub fn push_transport_error(&self) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(ProcessorError::Transport("connection reset".to_string())));
    }

    pub fn push_idempotency_conflict(&self) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(ProcessorError::IdempotencyConflict("conflict".to_string())));
    }

    pub fn set_context_unavailable(&self) {
        *self.context_unavailable.lock().unwrap() = true;
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.charges.lock().unwrap().clone()
    }

    pub fn charged_amounts(&self) -> Vec<i64> {
        self.charges().iter().map(|c| c.amount_cents).collect()
    }

    pub fn idempotency_keys(&self) -> Vec<String> {
        self.charges()
            .iter()
            .map(|c| c.idempotency_key.clone())
            .collect()
    }

    pub fn context_lookups(&self) -> usize {
        self.context_lookups.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessorHandler for FakeProcessor {
    fn processor(&self) -> &str {
        FAKE_PROCESSOR
    }

    async fn resolve_context(
        &self,
        request: &ContextRequest,
    ) -> Result<ProcessorContext, ProcessorError> {
        self.context_lookups.lock().unwrap().push(request.clone());
        if *self.context_unavailable.lock().unwrap() {
            return Err(ProcessorError::CustomerNotFound(request.payer_id));
        }
        Ok(ProcessorContext {
            customer_id: request
                .customer_id
                .clone()
                .unwrap_or_else(|| "cus_test".to_string()),
            payment_method_id: request
                .payment_method_id
                .clone()
                .unwrap_or_else(|| "pm_test".to_string()),
        })
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProcessorError> {
        let count = {
            let mut charges = self.charges.lock().unwrap();
            charges.push(request.clone());
            charges.len()
        };
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(ChargeOutcome::Succeeded {
                    processor_payment_id: format!("pi_test_{}", count),
                })
            })
    }
}

/// Notifier that records events and answers `sent` unless told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
    failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events()
            .iter()
            .map(|e| e.notification_type.as_str())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<NotificationOutcome, NotifyError> {
        self.events.lock().unwrap().push(event.clone());
        if *self.failing.lock().unwrap() {
            return Err(NotifyError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(NotificationOutcome::sent())
    }
}

/// Store, fake collaborators and a ready `JobContext`.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub processor: Arc<FakeProcessor>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: JobContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(JobSettings::default())
    }

    pub fn with_settings(settings: JobSettings) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let processor = FakeProcessor::new();
        let notifier = RecordingNotifier::new();
        let ctx = JobContext::new(
            store.clone(),
            ProcessorRegistry::new().with_handler(processor.clone()),
            notifier.clone(),
            settings,
        )
        .with_correlation_id("test-correlation-id");

        Self {
            store,
            processor,
            notifier,
            ctx,
        }
    }

    pub async fn financing_plan(
        &self,
        amount_cents: i64,
        term_count: u32,
        cadence: Cadence,
        start_at: DateTime<Utc>,
    ) -> FinancingPlan {
        self.financing_plan_with(amount_cents, term_count, cadence, start_at, FAKE_PROCESSOR)
            .await
    }

    pub async fn financing_plan_with(
        &self,
        amount_cents: i64,
        term_count: u32,
        cadence: Cadence,
        start_at: DateTime<Utc>,
        processor: &str,
    ) -> FinancingPlan {
        open_financing_plan(
            self.store.as_ref(),
            NewFinancingPlan {
                payer_id: Uuid::new_v4(),
                processor: ProcessorLink::new(processor),
                currency: "USD".to_string(),
                financed_amount_cents: amount_cents,
                term_count,
                cadence,
                start_at,
            },
            start_at,
        )
        .await
        .unwrap()
    }

    pub async fn subscription(
        &self,
        price_cents: i64,
        interval: RenewalInterval,
        first_charge_at: DateTime<Utc>,
    ) -> Subscription {
        open_subscription(
            self.store.as_ref(),
            NewSubscription {
                payer_id: Uuid::new_v4(),
                processor: ProcessorLink::new(FAKE_PROCESSOR),
                currency: "USD".to_string(),
                price_cents,
                interval,
                first_charge_at,
            },
            first_charge_at,
        )
        .await
        .unwrap()
    }

    pub async fn reload_plan(&self, plan_id: Uuid) -> FinancingPlan {
        use recurring_billing::services::BillingStore;
        self.store
            .get_financing_plan(plan_id)
            .await
            .unwrap()
            .expect("plan exists")
    }

    pub async fn reload_subscription(&self, subscription_id: Uuid) -> Subscription {
        use recurring_billing::services::BillingStore;
        self.store
            .get_subscription(subscription_id)
            .await
            .unwrap()
            .expect("subscription exists")
    }
}
