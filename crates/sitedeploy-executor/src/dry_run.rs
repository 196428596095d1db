//! Executor that pretends to start builds.

use async_trait::async_trait;
use sitedeploy_core::Result;
use sitedeploy_core::executor::{BuildExecutor, DispatchRequest, DispatchedRun};
use tracing::info;

/// Returns synthetic run ids without contacting any CI system.
///
/// Jobs dispatched here stay in processing until a callback is posted by
/// hand or the watchdog times them out.
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor;

impl DryRunExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BuildExecutor for DryRunExecutor {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchedRun> {
        info!(
            job_id = %request.job_id,
            deployment_type = %request.deployment_type,
            post_id = ?request.content.as_ref().map(|c| c.post_id),
            "Dry run dispatch"
        );
        Ok(DispatchedRun {
            run_id: format!("dry-run-{}", request.job_id),
            run_url: format!("http://localhost/dry-run/{}", request.job_id),
        })
    }
}
