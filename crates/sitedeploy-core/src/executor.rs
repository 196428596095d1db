//! Build executor trait and dispatch types.
//!
//! The orchestrator never builds the site itself. An executor hands the work
//! to an external CI system and returns identifiers that let a later report
//! be correlated with the job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ContentRef, DeploymentJob, DeploymentType, JobId, Result};

/// What an executor needs to start a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub job_id: JobId,
    pub deployment_type: DeploymentType,
    pub content: Option<ContentRef>,
}

impl From<&DeploymentJob> for DispatchRequest {
    fn from(job: &DeploymentJob) -> Self {
        Self {
            job_id: job.id,
            deployment_type: job.deployment_type,
            content: job.content_ref(),
        }
    }
}

/// Correlation identifiers for a started CI run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedRun {
    pub run_id: String,
    pub run_url: String,
}

/// Final result of a CI run as reported back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum BuildOutcome {
    Success {
        build_hash: Option<String>,
        deployment_url: Option<String>,
    },
    Failure {
        error: String,
    },
}

/// Trait for CI backends that run the actual site build.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Start a build for the job. Called at most once per job.
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchedRun>;
}
