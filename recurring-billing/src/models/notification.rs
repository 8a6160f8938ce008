//! Notification events and their dedupe key.

use super::payment_attempt::PlanKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notification kind, one collaborator endpoint per kind and plan family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationType {
    UpcomingCharge,
    ChargeFailed,
    Defaulted,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::UpcomingCharge => "upcoming-charge",
            NotificationType::ChargeFailed => "charge-failed",
            NotificationType::Defaulted => "defaulted",
        }
    }
}

/// Event handed to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub notification_type: NotificationType,
    pub family: PlanKind,
    pub entity_id: Uuid,
    pub payer_id: Uuid,
    /// Due date the event is about.
    pub scheduled_for: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_before: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_cents: Option<i64>,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl NotificationEvent {
    pub fn dedupe_key(&self) -> NotificationDedupeKey {
        NotificationDedupeKey {
            notification_type: self.notification_type,
            entity_type: self.family,
            entity_id: self.entity_id,
            scheduled_for: self.scheduled_for,
            days_before: self.days_before.unwrap_or(0),
        }
    }
}

/// Unique key of a notification that must be delivered at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NotificationDedupeKey {
    pub notification_type: NotificationType,
    pub entity_type: PlanKind,
    pub entity_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    pub days_before: i32,
}
