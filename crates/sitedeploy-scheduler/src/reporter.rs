//! Completion reporter: applies CI outcomes pushed back by the build system.

use sitedeploy_core::{BuildOutcome, DeploymentJob, Result};
use sitedeploy_db::JobRepo;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to a reported outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportResult {
    /// The processing job for the run moved to a terminal status.
    Applied(DeploymentJob),
    /// The job had already finished; nothing changed.
    AlreadyTerminal(DeploymentJob),
    /// No job carries this run id; the report was dropped.
    UnknownRun,
}

/// Applies build outcomes to the jobs that own them.
#[derive(Clone)]
pub struct CompletionReporter {
    repo: Arc<dyn JobRepo>,
}

impl CompletionReporter {
    pub fn new(repo: Arc<dyn JobRepo>) -> Self {
        Self { repo }
    }

    /// Apply `outcome` to the job that owns `run_id`.
    ///
    /// Duplicate and late reports never overwrite a terminal job, and an
    /// unknown run is logged rather than returned as an error.
    pub async fn report(&self, run_id: &str, outcome: &BuildOutcome) -> Result<ReportResult> {
        if let Some(job) = self.repo.complete_run(run_id, outcome).await? {
            info!(
                job_id = %job.id,
                run_id = %run_id,
                status = %job.status,
                build_hash = ?job.build_hash,
                error = ?job.error_message,
                "Deployment job finished"
            );
            return Ok(ReportResult::Applied(job));
        }

        match self.repo.find_by_run_id(run_id).await? {
            Some(job) => {
                debug!(job_id = %job.id, run_id = %run_id, status = %job.status, "Ignoring report for finished job");
                Ok(ReportResult::AlreadyTerminal(job))
            }
            None => {
                warn!(run_id = %run_id, "Dropping report for unknown run");
                Ok(ReportResult::UnknownRun)
            }
        }
    }
}
