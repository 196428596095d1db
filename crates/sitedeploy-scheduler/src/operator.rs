//! Operator actions: retry and cancel.

use sitedeploy_core::{DeploymentJob, Error, JobId, NewJob, Result};
use sitedeploy_db::{Inserted, JobRepo};
use std::sync::Arc;
use tracing::info;

use crate::TriggerIntake;

/// Retries and cancels jobs on behalf of an operator.
#[derive(Clone)]
pub struct RetryController {
    repo: Arc<dyn JobRepo>,
    intake: TriggerIntake,
}

impl RetryController {
    pub fn new(repo: Arc<dyn JobRepo>) -> Self {
        let intake = TriggerIntake::new(repo.clone());
        Self { repo, intake }
    }

    /// Enqueue a fresh job derived from a failed or cancelled one.
    ///
    /// The original row is never touched. If the post already has an active
    /// job again, that job is returned instead of a second one.
    pub async fn retry(&self, id: JobId) -> Result<Inserted> {
        let original = self.repo.get(id).await?;
        let new = NewJob::retry_of(&original)?;
        let inserted = self.intake.create_job(new).await?;
        info!(
            job_id = %inserted.job.id,
            retry_of = %original.id,
            created = inserted.created,
            "Retried deployment job"
        );
        Ok(inserted)
    }

    /// Cancel a pending or processing job. CI is not contacted; a later
    /// report for its run is ignored.
    pub async fn cancel(&self, id: JobId) -> Result<DeploymentJob> {
        if let Some(job) = self.repo.cancel(id).await? {
            info!(job_id = %job.id, run_id = ?job.github_run_id, "Cancelled deployment job");
            return Ok(job);
        }

        let current = self.repo.get(id).await?;
        Err(Error::Conflict(format!(
            "job {} is already {}",
            current.id, current.status
        )))
    }
}
