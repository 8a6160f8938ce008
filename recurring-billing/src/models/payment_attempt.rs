//! Payment attempt model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Plan family an attempt or notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Financing,
    Subscription,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Financing => "financing",
            PlanKind::Subscription => "subscription",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "financing" => Some(PlanKind::Financing),
            "subscription" => Some(PlanKind::Subscription),
            _ => None,
        }
    }
}

/// Attempt type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptType {
    Installment,
    /// Charge against principal outside the installment schedule.
    Principal,
    Renewal,
}

impl AttemptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptType::Installment => "installment",
            AttemptType::Principal => "principal",
            AttemptType::Renewal => "renewal",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "installment" => Some(AttemptType::Installment),
            "principal" => Some(AttemptType::Principal),
            "renewal" => Some(AttemptType::Renewal),
            _ => None,
        }
    }
}

/// Attempt status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Succeeded,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AttemptStatus::Pending),
            "succeeded" => Some(AttemptStatus::Succeeded),
            "failed" => Some(AttemptStatus::Failed),
            _ => None,
        }
    }
}

/// One charge attempt against the processor for a scheduled date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub attempt_id: Uuid,
    pub plan_kind: PlanKind,
    pub plan_id: Uuid,
    pub attempt_type: AttemptType,
    pub status: AttemptStatus,
    pub amount_cents: i64,
    pub currency: String,
    pub scheduled_for: DateTime<Utc>,
    pub idempotency_key: String,
    pub processor_payment_id: Option<String>,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a PENDING attempt.
#[derive(Debug, Clone)]
pub struct NewPaymentAttempt {
    pub plan_kind: PlanKind,
    pub plan_id: Uuid,
    pub attempt_type: AttemptType,
    pub amount_cents: i64,
    pub currency: String,
    pub scheduled_for: DateTime<Utc>,
    pub idempotency_key: String,
}

/// Terminal outcome recorded on an attempt after the processor call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResolution {
    Succeeded { processor_payment_id: String },
    Failed { failure_message: String },
}

impl AttemptResolution {
    pub fn status(&self) -> AttemptStatus {
        match self {
            AttemptResolution::Succeeded { .. } => AttemptStatus::Succeeded,
            AttemptResolution::Failed { .. } => AttemptStatus::Failed,
        }
    }
}

/// Idempotency key sent to the processor for a (plan, scheduled date) pair.
///
/// Stable across runs and processes so a retried charge for the same date is
/// collapsed by the processor.
pub fn idempotency_key(kind: PlanKind, plan_id: Uuid, scheduled_for: DateTime<Utc>) -> String {
    format!("{}:{}:{}", kind.as_str(), plan_id, scheduled_for.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let plan_id = Uuid::parse_str("6f1c2d4e-0000-4000-8000-000000000001").unwrap();
        let due = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();

        let key = idempotency_key(PlanKind::Financing, plan_id, due);

        assert_eq!(key, idempotency_key(PlanKind::Financing, plan_id, due));
        assert_eq!(
            key,
            "financing:6f1c2d4e-0000-4000-8000-000000000001:1736467200"
        );
        assert_ne!(key, idempotency_key(PlanKind::Subscription, plan_id, due));
    }
}
