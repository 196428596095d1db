//! Deployment jobs and their lifecycle.
//!
//! A job moves along a small directed graph:
//!
//! ```text
//! pending ──► processing ──► completed
//!    │            │    └───► failed
//!    └────────────┴────────► cancelled
//! ```
//!
//! Terminal states never transition again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, JobId, Result};

/// Status of a deployment job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Canonical storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the graph has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Cancelled)
        )
    }

    /// Whether a failed or cancelled job may be re-enqueued.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::Validation(format!("unknown job status: {}", other))),
        }
    }
}

/// Scope of a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentType {
    /// Rebuild scoped to one content item.
    Incremental,
    /// Rebuild of the entire static site.
    Full,
}

impl DeploymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::Incremental => "incremental",
            DeploymentType::Full => "full",
        }
    }
}

impl std::fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "incremental" => Ok(DeploymentType::Incremental),
            "full" => Ok(DeploymentType::Full),
            other => Err(Error::Validation(format!(
                "unknown deployment type: {}",
                other
            ))),
        }
    }
}

/// Origin of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    /// Content-change event from the CMS.
    Wordpress,
    /// Operator action in the admin UI.
    Manual,
    /// Programmatic API call.
    Api,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Wordpress => "wordpress",
            TriggerSource::Manual => "manual",
            TriggerSource::Api => "api",
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wordpress" => Ok(TriggerSource::Wordpress),
            "manual" => Ok(TriggerSource::Manual),
            "api" => Ok(TriggerSource::Api),
            other => Err(Error::Validation(format!(
                "unknown trigger source: {}",
                other
            ))),
        }
    }
}

/// Reference to a CMS content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    pub post_id: i64,
    pub post_slug: Option<String>,
    pub post_title: Option<String>,
}

impl ContentRef {
    pub fn new(post_id: i64) -> Self {
        Self {
            post_id,
            post_slug: None,
            post_title: None,
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.post_slug = Some(slug.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.post_title = Some(title.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.post_id <= 0 {
            return Err(Error::Validation(format!(
                "post_id must be positive, got {}",
                self.post_id
            )));
        }
        if self.post_slug.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(Error::Validation("post_slug must not be blank".to_string()));
        }
        Ok(())
    }
}

/// A tracked request to rebuild and redeploy the site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentJob {
    pub id: JobId,
    pub post_id: Option<i64>,
    pub post_slug: Option<String>,
    pub post_title: Option<String>,
    pub status: JobStatus,
    pub deployment_type: DeploymentType,
    pub triggered_by: TriggerSource,
    pub github_run_id: Option<String>,
    pub github_run_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub build_hash: Option<String>,
    pub deployment_url: Option<String>,
    pub metadata: serde_json::Value,
}

impl DeploymentJob {
    /// Materialise a freshly enqueued job.
    pub fn pending(new: NewJob, created_at: DateTime<Utc>) -> Self {
        let (post_id, post_slug, post_title) = match new.content {
            Some(c) => (Some(c.post_id), c.post_slug, c.post_title),
            None => (None, None, None),
        };
        Self {
            id: JobId::new(),
            post_id,
            post_slug,
            post_title,
            status: JobStatus::Pending,
            deployment_type: new.deployment_type,
            triggered_by: new.triggered_by,
            github_run_id: None,
            github_run_url: None,
            created_at,
            started_at: None,
            completed_at: None,
            error_message: None,
            build_hash: None,
            deployment_url: None,
            metadata: new.metadata,
        }
    }

    pub fn content_ref(&self) -> Option<ContentRef> {
        self.post_id.map(|post_id| ContentRef {
            post_id,
            post_slug: self.post_slug.clone(),
            post_title: self.post_title.clone(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seconds between start and completion, or start and `now` while running.
    pub fn duration_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or(now);
        Some((end - started).num_seconds())
    }

    /// Checks the timestamp and outcome-field invariants for the current status.
    pub fn check_invariants(&self) -> Result<()> {
        let started = self.started_at.is_some();
        let completed = self.completed_at.is_some();
        let broken = |what: &str| {
            Err(Error::Internal(format!(
                "job {} in status {} violates invariant: {}",
                self.id, self.status, what
            )))
        };

        if started == (self.status == JobStatus::Pending) {
            return broken("started_at set iff not pending");
        }
        if completed != self.status.is_terminal() {
            return broken("completed_at set iff terminal");
        }
        if let Some(started_at) = self.started_at {
            if started_at < self.created_at {
                return broken("created_at <= started_at");
            }
            if self.completed_at.is_some_and(|c| c < started_at) {
                return broken("started_at <= completed_at");
            }
        }
        if self.error_message.is_some() && self.status != JobStatus::Failed {
            return broken("error_message only on failed jobs");
        }
        if (self.build_hash.is_some() || self.deployment_url.is_some())
            && self.status != JobStatus::Completed
        {
            return broken("build outputs only on completed jobs");
        }
        Ok(())
    }
}

/// A validated request to enqueue a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub deployment_type: DeploymentType,
    pub triggered_by: TriggerSource,
    pub content: Option<ContentRef>,
    pub metadata: serde_json::Value,
}

impl NewJob {
    /// Validate the combination of origin, scope and content reference.
    ///
    /// Incremental jobs must name a post; full jobs must not.
    pub fn new(
        triggered_by: TriggerSource,
        deployment_type: DeploymentType,
        content: Option<ContentRef>,
    ) -> Result<Self> {
        match (deployment_type, &content) {
            (DeploymentType::Incremental, None) => {
                return Err(Error::Validation(
                    "incremental deployments require a post reference".to_string(),
                ));
            }
            (DeploymentType::Full, Some(_)) => {
                return Err(Error::Validation(
                    "full deployments must not reference a post".to_string(),
                ));
            }
            (DeploymentType::Incremental, Some(c)) => c.validate()?,
            (DeploymentType::Full, None) => {}
        }

        Ok(Self {
            deployment_type,
            triggered_by,
            content,
            metadata: serde_json::Value::Object(Default::default()),
        })
    }

    /// Attach a pass-through metadata bag. Must be a JSON object or null.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Result<Self> {
        self.metadata = match metadata {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            serde_json::Value::Object(_) => metadata,
            _ => {
                return Err(Error::Validation(
                    "metadata must be a JSON object".to_string(),
                ));
            }
        };
        Ok(self)
    }

    /// Derive a fresh job from a failed or cancelled one.
    ///
    /// The new job copies scope, origin and content, and records the original
    /// id under `metadata.retry_of`.
    pub fn retry_of(original: &DeploymentJob) -> Result<Self> {
        if !original.status.is_retryable() {
            return Err(Error::Conflict(format!(
                "job {} is {} and cannot be retried",
                original.id, original.status
            )));
        }

        let mut metadata = match &original.metadata {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        metadata.insert(
            "retry_of".to_string(),
            serde_json::Value::String(original.id.to_string()),
        );

        Ok(Self {
            deployment_type: original.deployment_type,
            triggered_by: original.triggered_by,
            content: original.content_ref(),
            metadata: serde_json::Value::Object(metadata),
        })
    }

    pub fn post_id(&self) -> Option<i64> {
        self.content.as_ref().map(|c| c.post_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn incremental(post_id: i64) -> NewJob {
        NewJob::new(
            TriggerSource::Wordpress,
            DeploymentType::Incremental,
            Some(ContentRef::new(post_id).with_slug("hello-world")),
        )
        .unwrap()
    }

    #[test]
    fn test_transition_graph_is_exact() {
        use JobStatus::*;
        let allowed = [
            (Pending, Processing),
            (Processing, Completed),
            (Processing, Failed),
            (Pending, Cancelled),
            (Processing, Cancelled),
        ];

        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in JobStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(JobStatus::ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn test_status_parse() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(matches!(
            "running".parse::<JobStatus>(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_incremental_requires_content() {
        let result = NewJob::new(TriggerSource::Api, DeploymentType::Incremental, None);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_full_rejects_content() {
        let result = NewJob::new(
            TriggerSource::Manual,
            DeploymentType::Full,
            Some(ContentRef::new(1)),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_rejects_non_positive_post_id() {
        let result = NewJob::new(
            TriggerSource::Api,
            DeploymentType::Incremental,
            Some(ContentRef::new(0)),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_metadata_must_be_object() {
        let job = incremental(3);
        assert!(job.clone().with_metadata(serde_json::json!([1, 2])).is_err());
        let job = job.with_metadata(serde_json::Value::Null).unwrap();
        assert_eq!(job.metadata, serde_json::json!({}));
    }

    #[test]
    fn test_pending_job_satisfies_invariants() {
        let job = DeploymentJob::pending(incremental(42), Utc::now());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.post_id, Some(42));
        assert_eq!(job.post_slug.as_deref(), Some("hello-world"));
        job.check_invariants().unwrap();
    }

    #[test]
    fn test_invariants_catch_outputs_on_failed_job() {
        let now = Utc::now();
        let mut job = DeploymentJob::pending(incremental(42), now);
        job.status = JobStatus::Failed;
        job.started_at = Some(now);
        job.completed_at = Some(now);
        job.error_message = Some("boom".to_string());
        job.check_invariants().unwrap();

        job.build_hash = Some("abc".to_string());
        assert!(job.check_invariants().is_err());
    }

    #[test]
    fn test_duration_seconds() {
        let now = Utc::now();
        let mut job = DeploymentJob::pending(incremental(1), now);
        assert_eq!(job.duration_seconds(now), None);

        job.status = JobStatus::Processing;
        job.started_at = Some(now);
        assert_eq!(job.duration_seconds(now + Duration::seconds(30)), Some(30));

        job.status = JobStatus::Completed;
        job.completed_at = Some(now + Duration::seconds(90));
        assert_eq!(job.duration_seconds(now + Duration::hours(1)), Some(90));
    }

    #[test]
    fn test_retry_copies_scope_and_references_original() {
        let now = Utc::now();
        let mut original = DeploymentJob::pending(
            incremental(7).with_metadata(serde_json::json!({"source": "editor"})).unwrap(),
            now,
        );
        original.status = JobStatus::Failed;

        let retry = NewJob::retry_of(&original).unwrap();
        assert_eq!(retry.deployment_type, DeploymentType::Incremental);
        assert_eq!(retry.triggered_by, TriggerSource::Wordpress);
        assert_eq!(retry.post_id(), Some(7));
        assert_eq!(retry.metadata["retry_of"], original.id.to_string());
        assert_eq!(retry.metadata["source"], "editor");
    }

    #[test]
    fn test_retry_rejects_completed_and_active_jobs() {
        let mut job = DeploymentJob::pending(incremental(7), Utc::now());
        for status in [JobStatus::Pending, JobStatus::Processing, JobStatus::Completed] {
            job.status = status;
            assert!(matches!(NewJob::retry_of(&job), Err(Error::Conflict(_))));
        }
    }

    #[test]
    fn test_serializes_enums_lowercase() {
        let job = DeploymentJob::pending(incremental(5), Utc::now());
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["deployment_type"], "incremental");
        assert_eq!(json["triggered_by"], "wordpress");
    }
}
