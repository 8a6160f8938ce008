use crate::models::{JobRun, JobRunStatus, JobType};
use crate::services::{metrics, BillingStore};
use serde::Serialize;
use service_core::error::AppError;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Persists the lifecycle of one job run: RUNNING, progress after every item,
/// then COMPLETED or FAILED.
pub struct JobRunTracker<'a> {
    store: &'a dyn BillingStore,
    run: JobRun,
}

impl<'a> JobRunTracker<'a> {
    pub async fn start<C: Serialize>(
        store: &'a dyn BillingStore,
        job_type: JobType,
        correlation_id: Option<&str>,
        counters: &C,
    ) -> Result<JobRunTracker<'a>, AppError> {
        let progress = serde_json::to_value(counters)?;
        let run = store
            .create_job_run(job_type, &progress, correlation_id)
            .await?;

        info!(
            run_id = %run.run_id,
            job_type = job_type.as_str(),
            correlation_id = correlation_id.unwrap_or_default(),
            "Job run started"
        );

        Ok(Self { store, run })
    }

    pub fn run_id(&self) -> Uuid {
        self.run.run_id
    }

    /// Best effort; a lost progress write never stops the job.
    pub async fn record_progress<C: Serialize>(&self, counters: &C) {
        let progress = match serde_json::to_value(counters) {
            Ok(progress) => progress,
            Err(e) => {
                warn!(run_id = %self.run.run_id, error = %e, "Failed to serialize job progress");
                return;
            }
        };
        if let Err(e) = self
            .store
            .update_job_run_progress(self.run.run_id, &progress)
            .await
        {
            warn!(run_id = %self.run.run_id, error = %e, "Failed to record job progress");
        }
    }

    pub async fn complete<C: Serialize>(self, counters: &C) -> Result<JobRun, AppError> {
        let summary = serde_json::to_value(counters)?;
        let run = self
            .store
            .finish_job_run(self.run.run_id, JobRunStatus::Completed, &summary, None)
            .await?;

        metrics::record_job_run(run.job_type.as_str(), JobRunStatus::Completed.as_str());
        info!(
            run_id = %run.run_id,
            job_type = run.job_type.as_str(),
            summary = %summary,
            "Job run completed"
        );

        Ok(run)
    }

    /// Mark the run FAILED. The caller still returns `cause`; a failure to
    /// write the FAILED record is only logged.
    pub async fn fail<C: Serialize>(self, cause: &AppError, counters: &C) {
        let job_type = self.run.job_type;
        metrics::record_job_run(job_type.as_str(), JobRunStatus::Failed.as_str());
        error!(
            run_id = %self.run.run_id,
            job_type = job_type.as_str(),
            error_kind = cause.kind(),
            error = %cause,
            "Job run failed"
        );

        let summary = serde_json::to_value(counters).unwrap_or(serde_json::Value::Null);
        let message = cause.to_string();
        if let Err(e) = self
            .store
            .finish_job_run(
                self.run.run_id,
                JobRunStatus::Failed,
                &summary,
                Some(message.as_str()),
            )
            .await
        {
            error!(run_id = %self.run.run_id, error = %e, "Failed to record job failure");
        }
    }
}
