//! Watchdog: fails jobs whose completion report never arrived.

use chrono::{DateTime, TimeDelta, Utc};
use sitedeploy_core::{DeploymentJob, Error, Result};
use sitedeploy_db::JobRepo;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Error message recorded on timed-out jobs.
pub const TIMEOUT_ERROR: &str = "timeout";

/// Sweeps jobs stuck in processing past the configured timeout.
#[derive(Clone)]
pub struct Watchdog {
    repo: Arc<dyn JobRepo>,
    timeout: Duration,
}

impl Watchdog {
    pub fn new(repo: Arc<dyn JobRepo>, timeout: Duration) -> Self {
        Self { repo, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Mark every job processing since before `now - timeout` as failed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<DeploymentJob>> {
        let timeout = TimeDelta::from_std(self.timeout)
            .map_err(|e| Error::Internal(format!("job timeout out of range: {}", e)))?;
        let timed_out = self.repo.fail_stale(now - timeout, TIMEOUT_ERROR).await?;

        for job in &timed_out {
            warn!(
                job_id = %job.id,
                run_id = ?job.github_run_id,
                started_at = ?job.started_at,
                "Deployment job timed out"
            );
        }
        Ok(timed_out)
    }
}
