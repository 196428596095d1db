//! Worker that periodically sweeps timed-out jobs and processes the queue.

use chrono::Utc;
use serde::Serialize;
use sitedeploy_config::ProcessorConfig;
use sitedeploy_core::{BuildExecutor, Result};
use sitedeploy_db::JobRepo;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use crate::{ProcessReport, QueueProcessor, Watchdog};

/// Outcome of one scheduled tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub timed_out: usize,
    #[serde(flatten)]
    pub process: ProcessReport,
}

/// Runs the watchdog sweep followed by a processing run.
///
/// The same tick backs both the scheduled HTTP trigger and the optional
/// in-process loop.
#[derive(Clone)]
pub struct Worker {
    id: String,
    watchdog: Watchdog,
    processor: QueueProcessor,
}

impl Worker {
    pub fn new(id: impl Into<String>, watchdog: Watchdog, processor: QueueProcessor) -> Self {
        Self {
            id: id.into(),
            watchdog,
            processor,
        }
    }

    pub fn from_config(
        id: impl Into<String>,
        repo: Arc<dyn JobRepo>,
        executor: Arc<dyn BuildExecutor>,
        config: &ProcessorConfig,
    ) -> Self {
        Self::new(
            id,
            Watchdog::new(repo.clone(), config.job_timeout()),
            QueueProcessor::new(repo, executor, config.batch_size),
        )
    }

    /// Sweep stale jobs, then claim and dispatch pending ones.
    pub async fn tick(&self) -> Result<TickReport> {
        let timed_out = self.watchdog.sweep(Utc::now()).await?.len();
        let process = self.processor.process_pending().await?;
        Ok(TickReport { timed_out, process })
    }

    /// Run ticks forever at `period`.
    pub async fn run(&self, period: Duration) {
        info!(worker_id = %self.id, period_secs = period.as_secs(), "Starting worker");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(report) if report.timed_out > 0 || report.process.claimed > 0 => {
                    info!(
                        worker_id = %self.id,
                        timed_out = report.timed_out,
                        claimed = report.process.claimed,
                        dispatched = report.process.dispatched,
                        "Worker tick"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Worker tick failed");
                }
            }
        }
    }
}
