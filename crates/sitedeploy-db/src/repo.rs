//! Deployment job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sitedeploy_core::{
    BuildOutcome, DeploymentJob, DispatchedRun, JobId, JobStatus, NewJob, TriggerSource,
};
use sqlx::PgPool;
use tracing::debug;

use crate::{DbError, DbResult};

/// How many times an insert retries when the active job it collided with
/// finishes before it can be read back.
const DEDUP_ATTEMPTS: usize = 3;

/// Result of a deduplicated insert.
#[derive(Debug, Clone)]
pub struct Inserted {
    pub job: DeploymentJob,
    /// False when an existing active job for the same post was returned.
    pub created: bool,
}

/// History query.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub triggered_by: Option<TriggerSource>,
    pub limit: i64,
    pub offset: i64,
}

/// One page of history, newest first.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<DeploymentJob>,
    pub total: i64,
}

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, n: i64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Cancelled => self.cancelled += n,
        }
    }
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Insert a pending job unless another non-terminal job exists for the
    /// same post, in which case that job is returned instead.
    async fn insert_deduplicated(&self, new: NewJob) -> DbResult<Inserted>;

    async fn get(&self, id: JobId) -> DbResult<DeploymentJob>;

    async fn find_by_run_id(&self, run_id: &str) -> DbResult<Option<DeploymentJob>>;

    async fn list(&self, filter: &JobFilter) -> DbResult<JobPage>;

    /// Oldest pending jobs, without claiming them.
    async fn oldest_pending(&self, limit: i64) -> DbResult<Vec<DeploymentJob>>;

    /// `pending → processing` if and only if the job is still pending.
    /// Returns `None` when another caller won the claim.
    async fn claim(&self, id: JobId) -> DbResult<Option<DeploymentJob>>;

    /// Claim up to `limit` of the oldest pending jobs.
    async fn claim_batch(&self, limit: i64) -> DbResult<Vec<DeploymentJob>> {
        let mut claimed = Vec::new();
        for candidate in self.oldest_pending(limit).await? {
            if let Some(job) = self.claim(candidate.id).await? {
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    /// Record CI correlation ids on a processing job that has none yet.
    async fn record_dispatch(
        &self,
        id: JobId,
        run: &DispatchedRun,
    ) -> DbResult<Option<DeploymentJob>>;

    /// `processing → failed` for the given job.
    async fn fail_processing(&self, id: JobId, error: &str) -> DbResult<Option<DeploymentJob>>;

    /// Apply a CI outcome to the processing job that owns `run_id`.
    /// Returns `None` when no processing job matches.
    async fn complete_run(
        &self,
        run_id: &str,
        outcome: &BuildOutcome,
    ) -> DbResult<Option<DeploymentJob>>;

    /// `pending|processing → cancelled`.
    async fn cancel(&self, id: JobId) -> DbResult<Option<DeploymentJob>>;

    /// Fail every job that has been processing since before `started_before`.
    async fn fail_stale(
        &self,
        started_before: DateTime<Utc>,
        error: &str,
    ) -> DbResult<Vec<DeploymentJob>>;

    async fn count_by_status(&self) -> DbResult<StatusCounts>;

    /// Cheap round-trip used by readiness checks.
    async fn ping(&self) -> DbResult<()>;
}

/// A job row as stored in PostgreSQL.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: uuid::Uuid,
    post_id: Option<i64>,
    post_slug: Option<String>,
    post_title: Option<String>,
    status: String,
    deployment_type: String,
    triggered_by: String,
    github_run_id: Option<String>,
    github_run_url: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    build_hash: Option<String>,
    deployment_url: Option<String>,
    metadata: serde_json::Value,
}

impl TryFrom<JobRow> for DeploymentJob {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        let corrupt = |e: sitedeploy_core::Error| DbError::Corrupt(format!("job {}: {}", row.id, e));
        Ok(DeploymentJob {
            id: JobId::from_uuid(row.id),
            status: row.status.parse().map_err(corrupt)?,
            deployment_type: row.deployment_type.parse().map_err(corrupt)?,
            triggered_by: row.triggered_by.parse().map_err(corrupt)?,
            post_id: row.post_id,
            post_slug: row.post_slug,
            post_title: row.post_title,
            github_run_id: row.github_run_id,
            github_run_url: row.github_run_url,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            build_hash: row.build_hash,
            deployment_url: row.deployment_url,
            metadata: row.metadata,
        })
    }
}

fn into_job(row: Option<JobRow>) -> DbResult<Option<DeploymentJob>> {
    row.map(DeploymentJob::try_from).transpose()
}

fn into_jobs(rows: Vec<JobRow>) -> DbResult<Vec<DeploymentJob>> {
    rows.into_iter().map(DeploymentJob::try_from).collect()
}

/// PostgreSQL implementation of JobRepo.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_active_for_post(&self, post_id: i64) -> DbResult<Option<DeploymentJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM deployment_jobs
            WHERE post_id = $1 AND status IN ('pending', 'processing')
            LIMIT 1
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn insert_deduplicated(&self, new: NewJob) -> DbResult<Inserted> {
        let post_id = new.post_id();
        let content = new.content.clone();

        for _ in 0..DEDUP_ATTEMPTS {
            let row = sqlx::query_as::<_, JobRow>(
                r#"
                INSERT INTO deployment_jobs
                    (id, post_id, post_slug, post_title, status, deployment_type, triggered_by, metadata, created_at)
                VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, NOW())
                ON CONFLICT (post_id) WHERE post_id IS NOT NULL AND status IN ('pending', 'processing')
                DO NOTHING
                RETURNING *
                "#,
            )
            .bind(uuid::Uuid::now_v7())
            .bind(post_id)
            .bind(content.as_ref().and_then(|c| c.post_slug.as_deref()))
            .bind(content.as_ref().and_then(|c| c.post_title.as_deref()))
            .bind(new.deployment_type.as_str())
            .bind(new.triggered_by.as_str())
            .bind(&new.metadata)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(job) = into_job(row)? {
                return Ok(Inserted { job, created: true });
            }

            // The insert collided with an active job for this post.
            let Some(post_id) = post_id else {
                return Err(DbError::Contention(
                    "insert without post_id returned no row".to_string(),
                ));
            };
            if let Some(job) = self.find_active_for_post(post_id).await? {
                return Ok(Inserted {
                    job,
                    created: false,
                });
            }
            debug!(post_id, "Active job finished during dedup, retrying insert");
        }

        Err(DbError::Contention(format!(
            "could not enqueue job for post {:?}",
            post_id
        )))
    }

    async fn get(&self, id: JobId) -> DbResult<DeploymentJob> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM deployment_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        into_job(row)?.ok_or_else(|| DbError::NotFound(format!("deployment job {}", id)))
    }

    async fn find_by_run_id(&self, run_id: &str) -> DbResult<Option<DeploymentJob>> {
        let row =
            sqlx::query_as::<_, JobRow>("SELECT * FROM deployment_jobs WHERE github_run_id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        into_job(row)
    }

    async fn list(&self, filter: &JobFilter) -> DbResult<JobPage> {
        let status = filter.status.map(|s| s.as_str());
        let triggered_by = filter.triggered_by.map(|t| t.as_str());

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM deployment_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR triggered_by = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(status)
        .bind(triggered_by)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM deployment_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR triggered_by = $2)
            "#,
        )
        .bind(status)
        .bind(triggered_by)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobPage {
            jobs: into_jobs(rows)?,
            total: total.0,
        })
    }

    async fn oldest_pending(&self, limit: i64) -> DbResult<Vec<DeploymentJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM deployment_jobs
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn claim(&self, id: JobId) -> DbResult<Option<DeploymentJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET status = 'processing', started_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    /// Claims with SKIP LOCKED so overlapping processors split the batch
    /// instead of queueing behind each other's row locks.
    async fn claim_batch(&self, limit: i64) -> DbResult<Vec<DeploymentJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET status = 'processing', started_at = NOW()
            WHERE id IN (
                SELECT id FROM deployment_jobs
                WHERE status = 'pending'
                ORDER BY created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = into_jobs(rows)?;
        jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(jobs)
    }

    async fn record_dispatch(
        &self,
        id: JobId,
        run: &DispatchedRun,
    ) -> DbResult<Option<DeploymentJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET github_run_id = $2, github_run_url = $3
            WHERE id = $1 AND status = 'processing' AND github_run_id IS NULL
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(&run.run_id)
        .bind(&run.run_url)
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    async fn fail_processing(&self, id: JobId, error: &str) -> DbResult<Option<DeploymentJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET status = 'failed', error_message = $2, completed_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    async fn complete_run(
        &self,
        run_id: &str,
        outcome: &BuildOutcome,
    ) -> DbResult<Option<DeploymentJob>> {
        let row = match outcome {
            BuildOutcome::Success {
                build_hash,
                deployment_url,
            } => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    UPDATE deployment_jobs
                    SET status = 'completed', build_hash = $2, deployment_url = $3, completed_at = NOW()
                    WHERE github_run_id = $1 AND status = 'processing'
                    RETURNING *
                    "#,
                )
                .bind(run_id)
                .bind(build_hash.as_deref())
                .bind(deployment_url.as_deref())
                .fetch_optional(&self.pool)
                .await?
            }
            BuildOutcome::Failure { error } => {
                sqlx::query_as::<_, JobRow>(
                    r#"
                    UPDATE deployment_jobs
                    SET status = 'failed', error_message = $2, completed_at = NOW()
                    WHERE github_run_id = $1 AND status = 'processing'
                    RETURNING *
                    "#,
                )
                .bind(run_id)
                .bind(error)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        into_job(row)
    }

    async fn cancel(&self, id: JobId) -> DbResult<Option<DeploymentJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET status = 'cancelled',
                started_at = COALESCE(started_at, NOW()),
                completed_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    async fn fail_stale(
        &self,
        started_before: DateTime<Utc>,
        error: &str,
    ) -> DbResult<Vec<DeploymentJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE deployment_jobs
            SET status = 'failed', error_message = $2, completed_at = NOW()
            WHERE status = 'processing' AND started_at < $1
            RETURNING *
            "#,
        )
        .bind(started_before)
        .bind(error)
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn count_by_status(&self) -> DbResult<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM deployment_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let status: JobStatus = status
                .parse()
                .map_err(|e: sitedeploy_core::Error| DbError::Corrupt(e.to_string()))?;
            counts.add(status, n);
        }
        Ok(counts)
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitedeploy_core::{ContentRef, DeploymentType};

    fn incremental(post_id: i64) -> NewJob {
        NewJob::new(
            TriggerSource::Wordpress,
            DeploymentType::Incremental,
            Some(ContentRef::new(post_id)),
        )
        .unwrap()
    }

    fn full() -> NewJob {
        NewJob::new(TriggerSource::Manual, DeploymentType::Full, None).unwrap()
    }

    fn run(id: &str) -> DispatchedRun {
        DispatchedRun {
            run_id: id.to_string(),
            run_url: format!("https://github.com/acme/site/actions/runs/{}", id),
        }
    }

    #[test]
    fn test_status_counts_add() {
        let mut counts = StatusCounts::default();
        counts.add(JobStatus::Failed, 2);
        counts.add(JobStatus::Pending, 1);
        counts.add(JobStatus::Failed, 1);
        assert_eq!(counts.failed, 3);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.completed, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
    async fn test_pg_dedup_returns_active_job(pool: PgPool) {
        let repo = PgJobRepo::new(pool);

        let first = repo.insert_deduplicated(incremental(42)).await.unwrap();
        let second = repo.insert_deduplicated(incremental(42)).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job.id, second.job.id);
        assert_eq!(repo.list(&JobFilter { limit: 10, ..Default::default() }).await.unwrap().total, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
    async fn test_pg_claim_is_exclusive(pool: PgPool) {
        let repo = PgJobRepo::new(pool);
        let job = repo.insert_deduplicated(full()).await.unwrap().job;

        let (a, b) = tokio::join!(repo.claim(job.id), repo.claim(job.id));
        let winners = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
        assert_eq!(winners, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
    async fn test_pg_concurrent_batches_do_not_overlap(pool: PgPool) {
        let repo = PgJobRepo::new(pool);
        for _ in 0..20 {
            repo.insert_deduplicated(full()).await.unwrap();
        }

        let batches = futures::future::join_all((0..4).map(|_| repo.claim_batch(10))).await;
        let mut ids: Vec<JobId> = batches
            .into_iter()
            .flat_map(|b| b.unwrap())
            .map(|j| j.id)
            .collect();
        let claimed = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), claimed);
        assert_eq!(claimed, 20);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
    async fn test_pg_full_lifecycle(pool: PgPool) {
        let repo = PgJobRepo::new(pool);
        let job = repo.insert_deduplicated(full()).await.unwrap().job;

        let claimed = repo.claim(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        claimed.check_invariants().unwrap();

        repo.record_dispatch(job.id, &run("1001")).await.unwrap().unwrap();
        assert!(repo.record_dispatch(job.id, &run("1002")).await.unwrap().is_none());

        let outcome = BuildOutcome::Success {
            build_hash: Some("abc123".to_string()),
            deployment_url: Some("https://site/abc123".to_string()),
        };
        let done = repo.complete_run("1001", &outcome).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.build_hash.as_deref(), Some("abc123"));
        done.check_invariants().unwrap();

        assert!(repo.complete_run("1001", &outcome).await.unwrap().is_none());
        assert!(repo.cancel(job.id).await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
    async fn test_pg_record_dispatch_skips_cancelled_job(pool: PgPool) {
        let repo = PgJobRepo::new(pool);
        let job = repo.insert_deduplicated(full()).await.unwrap().job;
        repo.claim(job.id).await.unwrap().unwrap();
        let cancelled = repo.cancel(job.id).await.unwrap().unwrap();

        assert!(repo.record_dispatch(job.id, &run("77")).await.unwrap().is_none());
        assert_eq!(repo.get(job.id).await.unwrap(), cancelled);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a PostgreSQL database (DATABASE_URL)"]
    async fn test_pg_trigger_rejects_terminal_regression(pool: PgPool) {
        let repo = PgJobRepo::new(pool.clone());
        let job = repo.insert_deduplicated(full()).await.unwrap().job;
        repo.cancel(job.id).await.unwrap().unwrap();

        let result = sqlx::query("UPDATE deployment_jobs SET status = 'pending' WHERE id = $1")
            .bind(job.id.as_uuid())
            .execute(&pool)
            .await;
        assert!(result.is_err());
    }
}
