//! Services module for recurring-billing.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod processor;
pub mod store;
pub mod stripe;

pub use database::Database;
pub use memory::InMemoryStore;
pub use notifier::{HttpNotifier, LedgerNotifier, NotificationOutcome, Notifier, NotifyError};
pub use processor::{
    ChargeOutcome, ChargeRequest, ContextRequest, ProcessorContext, ProcessorError,
    ProcessorHandler, ProcessorRegistry,
};
pub use store::BillingStore;
pub use stripe::{StripeProcessor, STRIPE_PROCESSOR};
pub use metrics::{
    init_metrics, record_charge_attempt, record_charged_amount, record_default, record_job_run,
    record_notification, write_metrics_textfile,
};
