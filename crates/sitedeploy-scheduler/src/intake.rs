//! Trigger intake: validated, deduplicated job creation.

use sitedeploy_core::{ContentRef, DeploymentType, NewJob, Result, TriggerSource};
use sitedeploy_db::{Inserted, JobRepo};
use std::sync::Arc;
use tracing::info;

/// Enqueues new deployment jobs.
#[derive(Clone)]
pub struct TriggerIntake {
    repo: Arc<dyn JobRepo>,
}

impl TriggerIntake {
    pub fn new(repo: Arc<dyn JobRepo>) -> Self {
        Self { repo }
    }

    /// Validate and enqueue a job.
    ///
    /// An incremental request for a post that already has a pending or
    /// processing job returns that job with `created == false`.
    pub async fn create(
        &self,
        source: TriggerSource,
        deployment_type: DeploymentType,
        content: Option<ContentRef>,
        metadata: serde_json::Value,
    ) -> Result<Inserted> {
        let new = NewJob::new(source, deployment_type, content)?.with_metadata(metadata)?;
        self.create_job(new).await
    }

    /// Enqueue an already validated job.
    pub async fn create_job(&self, new: NewJob) -> Result<Inserted> {
        let inserted = self.repo.insert_deduplicated(new).await?;
        let job = &inserted.job;

        if inserted.created {
            info!(
                job_id = %job.id,
                deployment_type = %job.deployment_type,
                triggered_by = %job.triggered_by,
                post_id = ?job.post_id,
                "Enqueued deployment job"
            );
        } else {
            info!(
                job_id = %job.id,
                status = %job.status,
                post_id = ?job.post_id,
                "Post already has an active deployment job"
            );
        }

        Ok(inserted)
    }
}
