//! Financing plan model and the pieces shared with subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Consecutive failed charges after which a plan or subscription defaults.
pub const DEFAULT_FAILURE_THRESHOLD: i32 = 3;

/// Financing plan status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancingStatus {
    Active,
    PaidOff,
    Canceled,
    Defaulted,
}

impl FinancingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinancingStatus::Active => "active",
            FinancingStatus::PaidOff => "paid_off",
            FinancingStatus::Canceled => "canceled",
            FinancingStatus::Defaulted => "defaulted",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "active" => Some(FinancingStatus::Active),
            "paid_off" => Some(FinancingStatus::PaidOff),
            "canceled" => Some(FinancingStatus::Canceled),
            "defaulted" => Some(FinancingStatus::Defaulted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FinancingStatus::Active)
    }
}

/// Installment cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Weekly,
    Monthly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "weekly" => Some(Cadence::Weekly),
            "monthly" => Some(Cadence::Monthly),
            _ => None,
        }
    }
}

/// One scheduled partial payment of a financing plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installment {
    /// 1-based position in the schedule.
    pub sequence: u32,
    pub due_at: DateTime<Utc>,
    pub amount_cents: i64,
}

/// Which processor bills the payer, plus references cached after first lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorLink {
    pub processor: String,
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
}

impl ProcessorLink {
    pub fn new(processor: impl Into<String>) -> Self {
        Self {
            processor: processor.into(),
            customer_id: None,
            payment_method_id: None,
        }
    }
}

/// Consecutive-failure bookkeeping shared by both plan families.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureTracker {
    pub failed_attempt_count: i32,
    pub last_failed_at: Option<DateTime<Utc>>,
}

impl FailureTracker {
    pub fn record_success(&mut self) {
        self.failed_attempt_count = 0;
        self.last_failed_at = None;
    }

    /// Count a failed charge. Returns true once `threshold` is reached.
    pub fn record_failure(&mut self, now: DateTime<Utc>, threshold: i32) -> bool {
        self.failed_attempt_count += 1;
        self.last_failed_at = Some(now);
        self.failed_attempt_count >= threshold
    }
}

/// Installment financing plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancingPlan {
    pub plan_id: Uuid,
    pub payer_id: Uuid,
    pub processor: ProcessorLink,
    pub currency: String,
    pub financed_amount_cents: i64,
    pub remaining_balance_cents: i64,
    pub status: FinancingStatus,
    pub cadence: Cadence,
    pub installments: Vec<Installment>,
    pub next_due_at: Option<DateTime<Utc>>,
    pub failures: FailureTracker,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FinancingPlan {
    pub fn is_active(&self) -> bool {
        self.status == FinancingStatus::Active
    }

    /// Installments whose due date has passed, earliest first.
    pub fn due_installments(&self, now: DateTime<Utc>) -> impl Iterator<Item = &Installment> {
        self.installments.iter().filter(move |i| i.due_at <= now)
    }

    /// Apply a settled charge; the balance never drops below zero.
    pub fn apply_payment(&mut self, amount_cents: i64) {
        self.remaining_balance_cents = (self.remaining_balance_cents - amount_cents).max(0);
        self.failures.record_success();
    }

    pub fn mark_paid_off(&mut self, now: DateTime<Utc>) {
        self.status = FinancingStatus::PaidOff;
        self.next_due_at = None;
        self.ended_at = Some(now);
    }

    pub fn mark_defaulted(&mut self, now: DateTime<Utc>) {
        self.status = FinancingStatus::Defaulted;
        self.next_due_at = None;
        self.ended_at = Some(now);
    }
}

/// Input for opening a financing plan at checkout.
#[derive(Debug, Clone)]
pub struct NewFinancingPlan {
    pub payer_id: Uuid,
    pub processor: ProcessorLink,
    pub currency: String,
    pub financed_amount_cents: i64,
    pub term_count: u32,
    pub cadence: Cadence,
    pub start_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_tracker_reaches_threshold() {
        let now = Utc::now();
        let mut tracker = FailureTracker::default();

        assert!(!tracker.record_failure(now, DEFAULT_FAILURE_THRESHOLD));
        assert!(!tracker.record_failure(now, DEFAULT_FAILURE_THRESHOLD));
        assert!(tracker.record_failure(now, DEFAULT_FAILURE_THRESHOLD));
        assert_eq!(tracker.failed_attempt_count, 3);
        assert_eq!(tracker.last_failed_at, Some(now));
    }

    #[test]
    fn test_success_resets_failures() {
        let mut tracker = FailureTracker::default();
        tracker.record_failure(Utc::now(), DEFAULT_FAILURE_THRESHOLD);
        tracker.record_failure(Utc::now(), DEFAULT_FAILURE_THRESHOLD);

        tracker.record_success();

        assert_eq!(tracker, FailureTracker::default());
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        assert_eq!(FinancingStatus::from_string("paid_off"), Some(FinancingStatus::PaidOff));
        assert_eq!(FinancingStatus::from_string("PAID_OFF"), None);
        assert!(FinancingStatus::Defaulted.is_terminal());
        assert!(!FinancingStatus::Active.is_terminal());
    }
}
