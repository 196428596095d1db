//! In-memory job repository for tests and local development.
//!
//! Every operation runs under one lock, so each conditional write is atomic
//! just like its SQL counterpart. State is lost on restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sitedeploy_core::{BuildOutcome, DeploymentJob, DispatchedRun, JobId, JobStatus, NewJob};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{DbError, DbResult, Inserted, JobFilter, JobPage, JobRepo, StatusCounts};

/// Thread-safe in-memory job repository.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobRepo {
    state: Arc<RwLock<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, StoredJob>,
    next_seq: u64,
}

#[derive(Debug, Clone)]
struct StoredJob {
    /// Insertion order, breaks created_at ties.
    seq: u64,
    job: DeploymentJob,
}

impl MemoryState {
    fn sorted_by<F>(&self, pred: F, newest_first: bool) -> Vec<&StoredJob>
    where
        F: Fn(&DeploymentJob) -> bool,
    {
        let mut jobs: Vec<&StoredJob> = self.jobs.values().filter(|s| pred(&s.job)).collect();
        jobs.sort_by_key(|s| (s.job.created_at, s.seq));
        if newest_first {
            jobs.reverse();
        }
        jobs
    }

    /// Apply `f` to the job if `guard` holds, returning the updated copy.
    fn update_if<G, F>(&mut self, id: JobId, guard: G, f: F) -> Option<DeploymentJob>
    where
        G: Fn(&DeploymentJob) -> bool,
        F: FnOnce(&mut DeploymentJob),
    {
        let stored = self.jobs.get_mut(&id)?;
        if !guard(&stored.job) {
            return None;
        }
        f(&mut stored.job);
        Some(stored.job.clone())
    }
}

impl MemoryJobRepo {
    /// Creates an empty in-memory repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> DbResult<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|err| DbError::Poisoned(err.to_string()))
    }

    fn write(&self) -> DbResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|err| DbError::Poisoned(err.to_string()))
    }

    /// Overwrite a job's start time, for exercising the watchdog in tests.
    pub fn backdate_start(&self, id: JobId, started_at: DateTime<Utc>) -> DbResult<()> {
        let mut state = self.write()?;
        let stored = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("deployment job {}", id)))?;
        stored.job.created_at = stored.job.created_at.min(started_at);
        stored.job.started_at = Some(started_at);
        Ok(())
    }
}

fn is_active(job: &DeploymentJob) -> bool {
    !job.status.is_terminal()
}

#[async_trait]
impl JobRepo for MemoryJobRepo {
    async fn insert_deduplicated(&self, new: NewJob) -> DbResult<Inserted> {
        let mut state = self.write()?;

        if let Some(post_id) = new.post_id() {
            let existing = state
                .jobs
                .values()
                .find(|s| s.job.post_id == Some(post_id) && is_active(&s.job));
            if let Some(existing) = existing {
                return Ok(Inserted {
                    job: existing.job.clone(),
                    created: false,
                });
            }
        }

        let job = DeploymentJob::pending(new, Utc::now());
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            job.id,
            StoredJob {
                seq,
                job: job.clone(),
            },
        );
        Ok(Inserted { job, created: true })
    }

    async fn get(&self, id: JobId) -> DbResult<DeploymentJob> {
        let state = self.read()?;
        state
            .jobs
            .get(&id)
            .map(|s| s.job.clone())
            .ok_or_else(|| DbError::NotFound(format!("deployment job {}", id)))
    }

    async fn find_by_run_id(&self, run_id: &str) -> DbResult<Option<DeploymentJob>> {
        let state = self.read()?;
        Ok(state
            .jobs
            .values()
            .find(|s| s.job.github_run_id.as_deref() == Some(run_id))
            .map(|s| s.job.clone()))
    }

    async fn list(&self, filter: &JobFilter) -> DbResult<JobPage> {
        let state = self.read()?;
        let matching = state.sorted_by(
            |job| {
                filter.status.is_none_or(|s| job.status == s)
                    && filter.triggered_by.is_none_or(|t| job.triggered_by == t)
            },
            true,
        );

        let total = matching.len() as i64;
        let jobs = matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .map(|s| s.job.clone())
            .collect();
        Ok(JobPage { jobs, total })
    }

    async fn oldest_pending(&self, limit: i64) -> DbResult<Vec<DeploymentJob>> {
        let state = self.read()?;
        Ok(state
            .sorted_by(|job| job.status == JobStatus::Pending, false)
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|s| s.job.clone())
            .collect())
    }

    async fn claim(&self, id: JobId) -> DbResult<Option<DeploymentJob>> {
        let mut state = self.write()?;
        Ok(state.update_if(
            id,
            |job| job.status == JobStatus::Pending,
            |job| {
                job.status = JobStatus::Processing;
                job.started_at = Some(Utc::now().max(job.created_at));
            },
        ))
    }

    async fn record_dispatch(
        &self,
        id: JobId,
        run: &DispatchedRun,
    ) -> DbResult<Option<DeploymentJob>> {
        let mut state = self.write()?;
        let taken = state
            .jobs
            .values()
            .any(|s| s.job.github_run_id.as_deref() == Some(run.run_id.as_str()));
        if taken {
            return Err(DbError::Contention(format!(
                "run {} already belongs to another job",
                run.run_id
            )));
        }
        Ok(state.update_if(
            id,
            |job| job.status == JobStatus::Processing && job.github_run_id.is_none(),
            |job| {
                job.github_run_id = Some(run.run_id.clone());
                job.github_run_url = Some(run.run_url.clone());
            },
        ))
    }

    async fn fail_processing(&self, id: JobId, error: &str) -> DbResult<Option<DeploymentJob>> {
        let mut state = self.write()?;
        Ok(state.update_if(
            id,
            |job| job.status == JobStatus::Processing,
            |job| finish(job, JobStatus::Failed, |j| j.error_message = Some(error.to_string())),
        ))
    }

    async fn complete_run(
        &self,
        run_id: &str,
        outcome: &BuildOutcome,
    ) -> DbResult<Option<DeploymentJob>> {
        let mut state = self.write()?;
        let Some(id) = state
            .jobs
            .values()
            .find(|s| s.job.github_run_id.as_deref() == Some(run_id))
            .map(|s| s.job.id)
        else {
            return Ok(None);
        };

        Ok(state.update_if(
            id,
            |job| job.status == JobStatus::Processing,
            |job| match outcome {
                BuildOutcome::Success {
                    build_hash,
                    deployment_url,
                } => finish(job, JobStatus::Completed, |j| {
                    j.build_hash = build_hash.clone();
                    j.deployment_url = deployment_url.clone();
                }),
                BuildOutcome::Failure { error } => finish(job, JobStatus::Failed, |j| {
                    j.error_message = Some(error.clone())
                }),
            },
        ))
    }

    async fn cancel(&self, id: JobId) -> DbResult<Option<DeploymentJob>> {
        let mut state = self.write()?;
        Ok(state.update_if(id, is_active, |job| {
            let now = Utc::now().max(job.created_at);
            job.started_at.get_or_insert(now);
            finish(job, JobStatus::Cancelled, |_| {})
        }))
    }

    async fn fail_stale(
        &self,
        started_before: DateTime<Utc>,
        error: &str,
    ) -> DbResult<Vec<DeploymentJob>> {
        let mut state = self.write()?;
        let stale: Vec<JobId> = state
            .jobs
            .values()
            .filter(|s| {
                s.job.status == JobStatus::Processing
                    && s.job.started_at.is_some_and(|t| t < started_before)
            })
            .map(|s| s.job.id)
            .collect();

        Ok(stale
            .into_iter()
            .filter_map(|id| {
                state.update_if(
                    id,
                    |job| job.status == JobStatus::Processing,
                    |job| {
                        finish(job, JobStatus::Failed, |j| {
                            j.error_message = Some(error.to_string())
                        })
                    },
                )
            })
            .collect())
    }

    async fn count_by_status(&self) -> DbResult<StatusCounts> {
        let state = self.read()?;
        let mut counts = StatusCounts::default();
        for stored in state.jobs.values() {
            counts.add(stored.job.status, 1);
        }
        Ok(counts)
    }

    async fn ping(&self) -> DbResult<()> {
        self.read().map(|_| ())
    }
}

/// Move a job into a terminal status, stamping `completed_at` once.
fn finish<F>(job: &mut DeploymentJob, status: JobStatus, apply: F)
where
    F: FnOnce(&mut DeploymentJob),
{
    let floor = job.started_at.unwrap_or(job.created_at);
    job.status = status;
    job.completed_at = Some(Utc::now().max(floor));
    apply(job);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sitedeploy_core::{ContentRef, DeploymentType, TriggerSource};

    fn incremental(post_id: i64) -> NewJob {
        NewJob::new(
            TriggerSource::Wordpress,
            DeploymentType::Incremental,
            Some(ContentRef::new(post_id)),
        )
        .unwrap()
    }

    fn full(source: TriggerSource) -> NewJob {
        NewJob::new(source, DeploymentType::Full, None).unwrap()
    }

    fn run(id: &str) -> DispatchedRun {
        DispatchedRun {
            run_id: id.to_string(),
            run_url: format!("https://ci.example/runs/{}", id),
        }
    }

    async fn processing(repo: &MemoryJobRepo, new: NewJob, run_id: &str) -> DeploymentJob {
        let job = repo.insert_deduplicated(new).await.unwrap().job;
        repo.claim(job.id).await.unwrap().unwrap();
        repo.record_dispatch(job.id, &run(run_id)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_dedup_while_pending_or_processing() {
        let repo = MemoryJobRepo::new();

        let first = repo.insert_deduplicated(incremental(42)).await.unwrap();
        let again = repo.insert_deduplicated(incremental(42)).await.unwrap();
        assert!(first.created);
        assert!(!again.created);
        assert_eq!(first.job.id, again.job.id);

        repo.claim(first.job.id).await.unwrap().unwrap();
        let during = repo.insert_deduplicated(incremental(42)).await.unwrap();
        assert!(!during.created);
        assert_eq!(during.job.id, first.job.id);

        let other_post = repo.insert_deduplicated(incremental(43)).await.unwrap();
        assert!(other_post.created);
    }

    #[tokio::test]
    async fn test_new_job_allowed_after_terminal() {
        let repo = MemoryJobRepo::new();
        let first = repo.insert_deduplicated(incremental(42)).await.unwrap().job;
        repo.cancel(first.id).await.unwrap().unwrap();

        let second = repo.insert_deduplicated(incremental(42)).await.unwrap();
        assert!(second.created);
        assert_ne!(second.job.id, first.id);
    }

    #[tokio::test]
    async fn test_full_jobs_are_not_deduplicated() {
        let repo = MemoryJobRepo::new();
        let a = repo.insert_deduplicated(full(TriggerSource::Manual)).await.unwrap();
        let b = repo.insert_deduplicated(full(TriggerSource::Manual)).await.unwrap();
        assert!(a.created && b.created);
        assert_ne!(a.job.id, b.job.id);
    }

    #[tokio::test]
    async fn test_claim_only_once() {
        let repo = MemoryJobRepo::new();
        let job = repo.insert_deduplicated(full(TriggerSource::Api)).await.unwrap().job;

        let claimed = repo.claim(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(claimed.started_at.is_some());
        claimed.check_invariants().unwrap();

        assert!(repo.claim(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_batch_oldest_first() {
        let repo = MemoryJobRepo::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(repo.insert_deduplicated(full(TriggerSource::Api)).await.unwrap().job.id);
        }

        let batch = repo.claim_batch(3).await.unwrap();
        let claimed: Vec<JobId> = batch.iter().map(|j| j.id).collect();
        assert_eq!(claimed, ids[..3].to_vec());

        let rest = repo.claim_batch(10).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(repo.claim_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_id_is_immutable() {
        let repo = MemoryJobRepo::new();
        let job = processing(&repo, full(TriggerSource::Api), "100").await;
        assert_eq!(job.github_run_id.as_deref(), Some("100"));

        assert!(repo.record_dispatch(job.id, &run("101")).await.unwrap().is_none());
        assert_eq!(
            repo.get(job.id).await.unwrap().github_run_id.as_deref(),
            Some("100")
        );
    }

    #[tokio::test]
    async fn test_record_dispatch_skips_cancelled_job() {
        let repo = MemoryJobRepo::new();
        let job = repo.insert_deduplicated(full(TriggerSource::Manual)).await.unwrap().job;
        repo.claim(job.id).await.unwrap().unwrap();
        let cancelled = repo.cancel(job.id).await.unwrap().unwrap();

        assert!(repo.record_dispatch(job.id, &run("77")).await.unwrap().is_none());

        let after = repo.get(job.id).await.unwrap();
        assert_eq!(after, cancelled);
        assert_eq!(after.github_run_id, None);
        assert_eq!(after.github_run_url, None);
    }

    #[tokio::test]
    async fn test_record_dispatch_skips_timed_out_job() {
        let repo = MemoryJobRepo::new();
        let job = repo.insert_deduplicated(full(TriggerSource::Api)).await.unwrap().job;
        repo.claim(job.id).await.unwrap().unwrap();
        let swept = repo
            .fail_stale(Utc::now() + Duration::seconds(1), "timeout")
            .await
            .unwrap();
        assert_eq!(swept.len(), 1);

        assert!(repo.record_dispatch(job.id, &run("78")).await.unwrap().is_none());

        let after = repo.get(job.id).await.unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.github_run_id, None);
    }

    #[tokio::test]
    async fn test_run_id_unique_across_jobs() {
        let repo = MemoryJobRepo::new();
        processing(&repo, full(TriggerSource::Api), "100").await;
        let other = repo.insert_deduplicated(full(TriggerSource::Api)).await.unwrap().job;
        repo.claim(other.id).await.unwrap();

        let result = repo.record_dispatch(other.id, &run("100")).await;
        assert!(matches!(result, Err(DbError::Contention(_))));
    }

    #[tokio::test]
    async fn test_complete_run_applies_once() {
        let repo = MemoryJobRepo::new();
        let job = processing(&repo, full(TriggerSource::Manual), "200").await;

        let success = BuildOutcome::Success {
            build_hash: Some("abc123".to_string()),
            deployment_url: Some("https://site/abc123".to_string()),
        };
        let done = repo.complete_run("200", &success).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.build_hash.as_deref(), Some("abc123"));
        assert_eq!(done.deployment_url.as_deref(), Some("https://site/abc123"));
        done.check_invariants().unwrap();

        let failure = BuildOutcome::Failure {
            error: "late failure".to_string(),
        };
        assert!(repo.complete_run("200", &failure).await.unwrap().is_none());
        assert!(repo.complete_run("200", &success).await.unwrap().is_none());
        assert_eq!(repo.get(job.id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn test_complete_unknown_run() {
        let repo = MemoryJobRepo::new();
        let outcome = BuildOutcome::Failure {
            error: "x".to_string(),
        };
        assert!(repo.complete_run("nope", &outcome).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_pending_sets_both_timestamps() {
        let repo = MemoryJobRepo::new();
        let job = repo.insert_deduplicated(full(TriggerSource::Manual)).await.unwrap().job;

        let cancelled = repo.cancel(job.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.started_at.is_some());
        assert!(cancelled.completed_at.is_some());
        cancelled.check_invariants().unwrap();

        assert!(repo.cancel(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_stale_only_touches_old_processing_jobs() {
        let repo = MemoryJobRepo::new();
        let old = processing(&repo, full(TriggerSource::Api), "1").await;
        let fresh = processing(&repo, full(TriggerSource::Api), "2").await;
        let pending = repo.insert_deduplicated(full(TriggerSource::Api)).await.unwrap().job;

        let now = Utc::now();
        repo.backdate_start(old.id, now - Duration::hours(2)).unwrap();

        let swept = repo
            .fail_stale(now - Duration::minutes(30), "timeout")
            .await
            .unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, old.id);
        assert_eq!(swept[0].error_message.as_deref(), Some("timeout"));
        swept[0].check_invariants().unwrap();

        assert_eq!(repo.get(fresh.id).await.unwrap().status, JobStatus::Processing);
        assert_eq!(repo.get(pending.id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates_newest_first() {
        let repo = MemoryJobRepo::new();
        let mut api_ids = Vec::new();
        for _ in 0..3 {
            api_ids.push(repo.insert_deduplicated(full(TriggerSource::Api)).await.unwrap().job.id);
        }
        let manual = repo.insert_deduplicated(full(TriggerSource::Manual)).await.unwrap().job;
        repo.cancel(manual.id).await.unwrap();

        let all = repo
            .list(&JobFilter {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.total, 4);
        assert_eq!(all.jobs[0].id, manual.id);

        let page = repo
            .list(&JobFilter {
                triggered_by: Some(TriggerSource::Api),
                limit: 2,
                offset: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        let ids: Vec<JobId> = page.jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![api_ids[1], api_ids[0]]);

        let cancelled = repo
            .list(&JobFilter {
                status: Some(JobStatus::Cancelled),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(cancelled.total, 1);
    }

    #[tokio::test]
    async fn test_count_by_status() {
        let repo = MemoryJobRepo::new();
        processing(&repo, full(TriggerSource::Api), "1").await;
        repo.insert_deduplicated(full(TriggerSource::Api)).await.unwrap();
        repo.insert_deduplicated(incremental(9)).await.unwrap();

        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.completed, 0);
    }
}
