//! Application state.

use sitedeploy_config::{AuthConfig, ProcessorConfig};
use sitedeploy_core::BuildExecutor;
use sitedeploy_db::JobRepo;
use sitedeploy_scheduler::{CompletionReporter, RetryController, TriggerIntake, Worker};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn JobRepo>,
    pub intake: TriggerIntake,
    pub operator: RetryController,
    pub reporter: CompletionReporter,
    pub worker: Worker,
    pub auth: Arc<AuthConfig>,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn JobRepo>,
        executor: Arc<dyn BuildExecutor>,
        processor: &ProcessorConfig,
        auth: AuthConfig,
    ) -> Self {
        Self {
            intake: TriggerIntake::new(repo.clone()),
            operator: RetryController::new(repo.clone()),
            reporter: CompletionReporter::new(repo.clone()),
            worker: Worker::from_config("http", repo.clone(), executor, processor),
            auth: Arc::new(auth),
            repo,
        }
    }
}
