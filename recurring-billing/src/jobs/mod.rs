//! Batch jobs: financing installments, subscription renewals and upcoming
//! charge reminders.
//!
//! Each job is a single sequential pass over the due items. Per-item failures
//! are counted and logged; only failures that make the whole pass meaningless
//! (the due-item query, the run record) fail the job.

mod charge;
mod financing;
mod reminders;
mod subscriptions;
mod tracker;

pub use financing::charge_financing_plans;
pub use reminders::send_reminders;
pub use subscriptions::charge_subscriptions;
pub use tracker::JobRunTracker;

use crate::config::JobSettings;
use crate::services::{BillingStore, Notifier, ProcessorRegistry};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

/// Collaborators shared by every job, built once at process start.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn BillingStore>,
    pub processors: ProcessorRegistry,
    pub notifier: Arc<dyn Notifier>,
    pub settings: JobSettings,
    pub correlation_id: Option<String>,
}

impl JobContext {
    pub fn new(
        store: Arc<dyn BillingStore>,
        processors: ProcessorRegistry,
        notifier: Arc<dyn Notifier>,
        settings: JobSettings,
    ) -> Self {
        Self {
            store,
            processors,
            notifier,
            settings,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// PENDING attempts created before this instant no longer block a charge.
    fn stale_pending_before(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        self.settings
            .pending_stale_after
            .map(|age| {
                now.checked_sub_signed(age).ok_or_else(|| {
                    AppError::ConfigError(anyhow!(
                        "PENDING staleness cutoff of {} minutes is out of range",
                        age.num_minutes()
                    ))
                })
            })
            .transpose()
    }
}

/// Final counters of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobReport<C> {
    pub run_id: Uuid,
    pub counters: C,
}
