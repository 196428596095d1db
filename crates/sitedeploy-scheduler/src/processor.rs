//! Queue processor: claims pending jobs and hands them to the build executor.

use serde::Serialize;
use sitedeploy_core::{BuildExecutor, DeploymentJob, DispatchRequest, Result, TriggerSource};
use sitedeploy_db::JobRepo;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of one processing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub claimed: usize,
    pub dispatched: usize,
    pub dispatch_failures: usize,
}

enum Dispatch {
    Sent,
    Failed,
}

/// Claims pending jobs and dispatches each exactly once.
#[derive(Clone)]
pub struct QueueProcessor {
    repo: Arc<dyn JobRepo>,
    executor: Arc<dyn BuildExecutor>,
    batch_size: i64,
}

impl QueueProcessor {
    pub fn new(repo: Arc<dyn JobRepo>, executor: Arc<dyn BuildExecutor>, batch_size: u32) -> Self {
        Self {
            repo,
            executor,
            batch_size: i64::from(batch_size.max(1)),
        }
    }

    /// Claim a batch of the oldest pending jobs and dispatch them.
    ///
    /// Safe to run concurrently: a job is only dispatched by the caller whose
    /// `pending → processing` write succeeded.
    pub async fn process_pending(&self) -> Result<ProcessReport> {
        let claimed = self.repo.claim_batch(self.batch_size).await?;
        let mut report = ProcessReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            debug!("No pending deployment jobs");
            return Ok(report);
        }

        let results = futures::future::join_all(claimed.iter().map(|job| self.dispatch(job))).await;

        for result in results {
            match result {
                Dispatch::Sent => report.dispatched += 1,
                Dispatch::Failed => report.dispatch_failures += 1,
            }
        }

        info!(
            executor = self.executor.name(),
            claimed = report.claimed,
            dispatched = report.dispatched,
            dispatch_failures = report.dispatch_failures,
            "Processed pending deployment jobs"
        );
        Ok(report)
    }

    async fn dispatch(&self, job: &DeploymentJob) -> Dispatch {
        let request = DispatchRequest::from(job);

        let run = match self.executor.dispatch(&request).await {
            Ok(run) => run,
            Err(e) => {
                self.record_failure(job, &e.to_string()).await;
                return Dispatch::Failed;
            }
        };

        match self.repo.record_dispatch(job.id, &run).await {
            Ok(Some(_)) => {
                info!(
                    job_id = %job.id,
                    run_id = %run.run_id,
                    run_url = %run.run_url,
                    "Dispatched deployment job"
                );
                Dispatch::Sent
            }
            Ok(None) => {
                // Left processing (cancelled or timed out) before the run was recorded;
                // the run's report will be ignored.
                warn!(job_id = %job.id, run_id = %run.run_id, "Job left processing before dispatch was recorded");
                Dispatch::Sent
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    run_id = %run.run_id,
                    error = %e,
                    "Failed to record dispatched run; watchdog will time the job out"
                );
                Dispatch::Failed
            }
        }
    }

    async fn record_failure(&self, job: &DeploymentJob, message: &str) {
        if job.triggered_by == TriggerSource::Wordpress {
            error!(job_id = %job.id, post_id = ?job.post_id, error = %message, "CMS deployment dispatch failed");
        } else {
            warn!(job_id = %job.id, error = %message, "Deployment dispatch failed");
        }

        if let Err(e) = self.repo.fail_processing(job.id, message).await {
            error!(job_id = %job.id, error = %e, "Failed to record dispatch failure");
        }
    }
}
