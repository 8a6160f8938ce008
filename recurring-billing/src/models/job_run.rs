//! Job run model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ChargeFinancing,
    ChargeSubscriptions,
    SendReminders,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ChargeFinancing => "charge_financing",
            JobType::ChargeSubscriptions => "charge_subscriptions",
            JobType::SendReminders => "send_reminders",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "charge_financing" => Some(JobType::ChargeFinancing),
            "charge_subscriptions" => Some(JobType::ChargeSubscriptions),
            "send_reminders" => Some(JobType::SendReminders),
            _ => None,
        }
    }
}

/// Job run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Running,
    Completed,
    Failed,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Running => "running",
            JobRunStatus::Completed => "completed",
            JobRunStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobRunStatus::Running),
            "completed" => Some(JobRunStatus::Completed),
            "failed" => Some(JobRunStatus::Failed),
            _ => None,
        }
    }
}

/// One execution of a batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: Uuid,
    pub job_type: JobType,
    pub status: JobRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: serde_json::Value,
    pub summary: Option<serde_json::Value>,
    pub error: Option<String>,
    pub correlation_id: Option<String>,
}

/// Running counters of the two charge jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeCounters {
    /// Plans or subscriptions looked at.
    pub processed: u32,
    /// Successful processor charges.
    pub charged: u32,
    /// Declined or errored processor charges.
    pub failed: u32,
    /// Items left alone this run (paid, pending, retried today, unsupported).
    pub skipped: u32,
    pub defaulted: u32,
    pub paid_off: u32,
    /// Items that hit an unexpected error and were left for the next run.
    pub errors: u32,
}

/// Running counters of the reminder job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderCounters {
    pub processed: u32,
    pub sent: u32,
    pub skipped: u32,
    pub failed: u32,
}
