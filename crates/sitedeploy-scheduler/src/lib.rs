//! Job scheduling for sitedeploy.
//!
//! Accepts new deployment jobs, claims and dispatches them to a build
//! executor, applies CI outcomes, and sweeps jobs whose report never arrived.
//! All coordination goes through conditional writes on the job store, so any
//! number of processors may run at once.

pub mod intake;
pub mod operator;
pub mod processor;
pub mod reporter;
pub mod watchdog;
pub mod worker;

pub use intake::TriggerIntake;
pub use operator::RetryController;
pub use processor::{ProcessReport, QueueProcessor};
pub use reporter::{CompletionReporter, ReportResult};
pub use watchdog::{TIMEOUT_ERROR, Watchdog};
pub use worker::{TickReport, Worker};
