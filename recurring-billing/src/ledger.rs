//! Reconciles payment attempt history into per-date charge state.
//!
//! The ledger is what makes the charge jobs safe to re-run and to overlap: a
//! date that already has a SUCCEEDED attempt is never charged again, and a
//! date with an unresolved PENDING attempt belongs to whichever run created it.

use crate::models::{AttemptStatus, PaymentAttempt};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Charge state of one scheduled date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateState {
    /// A SUCCEEDED attempt exists.
    Paid,
    /// An unresolved PENDING attempt exists; another run owns it.
    Pending,
    /// No attempt yet, or only FAILED ones. Eligible to charge.
    Open,
}

#[derive(Debug, Default)]
pub struct PaymentLedger {
    by_date: BTreeMap<DateTime<Utc>, Vec<PaymentAttempt>>,
    stale_pending_before: Option<DateTime<Utc>>,
}

impl PaymentLedger {
    /// Index `attempts` by scheduled date.
    ///
    /// PENDING attempts created before `stale_pending_before` no longer block
    /// their date. `None` keeps every PENDING attempt blocking until an operator
    /// resolves it.
    pub fn from_attempts(
        attempts: impl IntoIterator<Item = PaymentAttempt>,
        stale_pending_before: Option<DateTime<Utc>>,
    ) -> Self {
        let mut by_date: BTreeMap<DateTime<Utc>, Vec<PaymentAttempt>> = BTreeMap::new();
        for attempt in attempts {
            by_date.entry(attempt.scheduled_for).or_default().push(attempt);
        }
        // Creation order; equal timestamps fall back to the attempt id so the
        // "latest" attempt is the same on every read.
        for bucket in by_date.values_mut() {
            bucket.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.attempt_id.cmp(&b.attempt_id))
            });
        }

        Self {
            by_date,
            stale_pending_before,
        }
    }

    pub fn state(&self, scheduled_for: DateTime<Utc>) -> DateState {
        let Some(bucket) = self.by_date.get(&scheduled_for) else {
            return DateState::Open;
        };

        if bucket.iter().any(|a| a.status == AttemptStatus::Succeeded) {
            return DateState::Paid;
        }

        if bucket
            .iter()
            .any(|a| a.status == AttemptStatus::Pending && !self.is_stale(a))
        {
            return DateState::Pending;
        }

        DateState::Open
    }

    /// Most recently created attempt for the date.
    pub fn latest(&self, scheduled_for: DateTime<Utc>) -> Option<&PaymentAttempt> {
        self.by_date.get(&scheduled_for).and_then(|b| b.last())
    }

    pub fn is_paid(&self, scheduled_for: DateTime<Utc>) -> bool {
        self.state(scheduled_for) == DateState::Paid
    }

    /// Fold a freshly resolved attempt back in so later dates in the same run
    /// see it.
    pub fn record(&mut self, attempt: PaymentAttempt) {
        let bucket = self.by_date.entry(attempt.scheduled_for).or_default();
        match bucket.iter_mut().find(|a| a.attempt_id == attempt.attempt_id) {
            Some(existing) => *existing = attempt,
            None => bucket.push(attempt),
        }
    }

    fn is_stale(&self, attempt: &PaymentAttempt) -> bool {
        self.stale_pending_before
            .is_some_and(|cutoff| attempt.created_at < cutoff)
    }
}
