//! Subscription model.

use super::plan::{FailureTracker, ProcessorLink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    Defaulted,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Defaulted => "defaulted",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "defaulted" => Some(SubscriptionStatus::Defaulted),
            _ => None,
        }
    }
}

/// Renewal interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalInterval {
    Monthly,
    Quarterly,
    SemiAnnual,
    Annual,
}

impl RenewalInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalInterval::Monthly => "monthly",
            RenewalInterval::Quarterly => "quarterly",
            RenewalInterval::SemiAnnual => "semi_annual",
            RenewalInterval::Annual => "annual",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(RenewalInterval::Monthly),
            "quarterly" => Some(RenewalInterval::Quarterly),
            "semi_annual" => Some(RenewalInterval::SemiAnnual),
            "annual" => Some(RenewalInterval::Annual),
            _ => None,
        }
    }

    pub fn months(&self) -> u32 {
        match self {
            RenewalInterval::Monthly => 1,
            RenewalInterval::Quarterly => 3,
            RenewalInterval::SemiAnnual => 6,
            RenewalInterval::Annual => 12,
        }
    }
}

/// Recurring subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub payer_id: Uuid,
    pub processor: ProcessorLink,
    pub currency: String,
    pub price_cents: i64,
    pub interval: RenewalInterval,
    pub status: SubscriptionStatus,
    pub next_charge_at: Option<DateTime<Utc>>,
    pub failures: FailureTracker,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    pub fn mark_defaulted(&mut self, now: DateTime<Utc>) {
        self.status = SubscriptionStatus::Defaulted;
        self.next_charge_at = None;
        self.ended_at = Some(now);
    }
}

/// Input for opening a subscription at checkout.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub payer_id: Uuid,
    pub processor: ProcessorLink,
    pub currency: String,
    pub price_cents: i64,
    pub interval: RenewalInterval,
    pub first_charge_at: DateTime<Utc>,
}
