//! Build executor backends for the sitedeploy orchestrator.
//!
//! Provides executor implementations that start site builds:
//! - GitHub Actions `workflow_dispatch` (production)
//! - Dry run (local development)

pub mod dry_run;
pub mod github;

pub use dry_run::DryRunExecutor;
pub use github::{GitHubActionsExecutor, GitHubError};
pub use sitedeploy_core::executor::{BuildExecutor, BuildOutcome, DispatchRequest, DispatchedRun};
