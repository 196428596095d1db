//! Poll a job until it reaches a terminal status.

use anyhow::{Result, bail};
use sitedeploy_core::{DeploymentJob, JobId, JobStatus};
use std::time::Duration;
use tracing::warn;

use super::describe;
use crate::client::{ApiClient, ClientError};

/// Consecutive transport failures tolerated before giving up.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Remembers the last status seen so each change is reported once.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: Option<JobStatus>,
}

impl StatusTracker {
    /// Returns the status if it differs from the previous observation.
    pub fn observe(&mut self, status: JobStatus) -> Option<JobStatus> {
        if self.last == Some(status) {
            return None;
        }
        self.last = Some(status);
        Some(status)
    }
}

pub async fn run(client: &ApiClient, id: JobId, interval: Duration) -> Result<()> {
    let job = poll_until_terminal(client, id, interval, |job| {
        println!("{}  {}", chrono::Utc::now().format("%H:%M:%S"), job.status);
    })
    .await?;

    println!("{}", describe(&job));
    if job.status != JobStatus::Completed {
        bail!("deployment {} ended as {}", job.id, job.status);
    }
    Ok(())
}

/// Poll `GET /deployments/{id}` every `interval`, calling `on_change` once per
/// status change, until the job is terminal.
pub async fn poll_until_terminal<F>(
    client: &ApiClient,
    id: JobId,
    interval: Duration,
    mut on_change: F,
) -> Result<DeploymentJob>
where
    F: FnMut(&DeploymentJob),
{
    let mut tracker = StatusTracker::default();
    let mut errors = 0;

    loop {
        match client.status(id).await {
            Ok(envelope) => {
                errors = 0;
                let job = envelope.job;
                if tracker.observe(job.status).is_some() {
                    on_change(&job);
                }
                if job.is_terminal() {
                    return Ok(job);
                }
            }
            Err(e @ ClientError::Api { .. }) => return Err(e.into()),
            Err(e) => {
                errors += 1;
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    return Err(e.into());
                }
                warn!(error = %e, attempt = errors, "Status poll failed; retrying");
            }
        }
        tokio::time::sleep(interval).await;
    }
}
