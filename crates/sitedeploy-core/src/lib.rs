//! Core domain types and traits for the sitedeploy orchestrator.
//!
//! This crate contains:
//! - Job identifiers and the deployment job record
//! - The job status graph and its transition rules
//! - The build executor trait used to dispatch CI runs
//! - The shared error taxonomy

pub mod error;
pub mod executor;
pub mod id;
pub mod job;

pub use error::{Error, Result};
pub use executor::{BuildExecutor, BuildOutcome, DispatchRequest, DispatchedRun};
pub use id::JobId;
pub use job::{
    ContentRef, DeploymentJob, DeploymentType, JobStatus, NewJob, TriggerSource,
};
