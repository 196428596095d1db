//! GitHub Actions executor.
//!
//! Starts the site build workflow through `workflow_dispatch` and correlates
//! the resulting run with the job. The workflow is expected to accept a
//! `job_id` input and use it in its `run-name`, e.g.
//!
//! ```yaml
//! run-name: deploy ${{ inputs.job_id }}
//! ```

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use sitedeploy_config::{GitHubConfig, SecretString};
use sitedeploy_core::executor::{BuildExecutor, DispatchRequest, DispatchedRun};
use sitedeploy_core::{Error, JobId, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runs created slightly before our clock says we dispatched still count.
const CLOCK_SKEW_SECS: i64 = 10;

/// GitHub Actions `workflow_dispatch` executor.
pub struct GitHubActionsExecutor {
    client: reqwest::Client,
    api_url: String,
    owner: String,
    repo: String,
    workflow: String,
    git_ref: String,
    token: SecretString,
    lookup_attempts: u32,
    lookup_delay: Duration,
}

impl GitHubActionsExecutor {
    pub fn new(
        api_url: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        workflow: impl Into<String>,
        git_ref: impl Into<String>,
        token: SecretString,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            repo: repo.into(),
            workflow: workflow.into(),
            git_ref: git_ref.into(),
            token,
            lookup_attempts: 5,
            lookup_delay: Duration::from_secs(2),
        }
    }

    /// Build from configuration; `None` unless owner, repo and token are set.
    pub fn from_config(config: &GitHubConfig) -> Option<Self> {
        Some(Self::new(
            config.api_url.clone(),
            config.owner.clone()?,
            config.repo.clone()?,
            config.workflow.clone(),
            config.git_ref.clone(),
            config.token.clone()?,
        ))
    }

    /// Tune how long to search for the run when GitHub doesn't return its id.
    pub fn with_lookup(mut self, attempts: u32, delay: Duration) -> Self {
        self.lookup_attempts = attempts.max(1);
        self.lookup_delay = delay;
        self
    }

    fn workflow_endpoint(&self) -> String {
        format!(
            "{}/repos/{}/{}/actions/workflows/{}",
            self.api_url,
            self.owner,
            self.repo,
            urlencoding::encode(&self.workflow)
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(self.token.expose())
            .header("User-Agent", "sitedeploy")
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Search recent dispatch runs for the one titled with this job id.
    async fn find_run(
        &self,
        job_id: JobId,
        dispatched_after: DateTime<Utc>,
    ) -> std::result::Result<Option<DispatchedRun>, GitHubError> {
        let created = format!(
            ">={}",
            dispatched_after.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let response = self
            .request(Method::GET, &format!("{}/runs", self.workflow_endpoint()))
            .query(&[
                ("event", "workflow_dispatch"),
                ("created", created.as_str()),
                ("per_page", "30"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GitHubError::from_response(response, "list workflow runs").await);
        }

        let runs: WorkflowRuns = response
            .json()
            .await
            .map_err(|e| GitHubError::Parse(e.to_string()))?;
        Ok(match_run(&runs.workflow_runs, job_id).map(|run| DispatchedRun {
            run_id: run.id.to_string(),
            run_url: run.html_url.clone(),
        }))
    }
}

#[async_trait]
impl BuildExecutor for GitHubActionsExecutor {
    fn name(&self) -> &'static str {
        "github-actions"
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchedRun> {
        let dispatched_after = Utc::now() - chrono::Duration::seconds(CLOCK_SKEW_SECS);
        let body = dispatch_body(&self.git_ref, request);

        let response = self
            .request(
                Method::POST,
                &format!("{}/dispatches", self.workflow_endpoint()),
            )
            .json(&body)
            .send()
            .await
            .map_err(GitHubError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(GitHubError::from_response(response, "dispatch workflow")
                .await
                .into());
        }

        if status == StatusCode::OK {
            match response.json::<DispatchDetails>().await {
                Ok(details) => {
                    let run = details.into_run();
                    info!(job_id = %request.job_id, run_id = %run.run_id, "Dispatched workflow run");
                    return Ok(run);
                }
                Err(e) => debug!(error = %e, "Dispatch response carried no run details"),
            }
        }

        for attempt in 0..self.lookup_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.lookup_delay).await;
            }
            if let Some(run) = self.find_run(request.job_id, dispatched_after).await? {
                info!(
                    job_id = %request.job_id,
                    run_id = %run.run_id,
                    attempt,
                    "Located dispatched workflow run"
                );
                return Ok(run);
            }
        }

        warn!(job_id = %request.job_id, "Workflow dispatched but run not found");
        Err(GitHubError::RunNotFound(request.job_id).into())
    }
}

/// Request body for `POST .../dispatches`. Workflow inputs must be strings.
fn dispatch_body(git_ref: &str, request: &DispatchRequest) -> serde_json::Value {
    let mut inputs = serde_json::Map::new();
    inputs.insert("job_id".into(), request.job_id.to_string().into());
    inputs.insert(
        "deployment_type".into(),
        request.deployment_type.as_str().into(),
    );
    if let Some(content) = &request.content {
        inputs.insert("post_id".into(), content.post_id.to_string().into());
        if let Some(slug) = &content.post_slug {
            inputs.insert("post_slug".into(), slug.clone().into());
        }
    }

    serde_json::json!({
        "ref": git_ref,
        "inputs": inputs,
        "return_run_details": true,
    })
}

fn match_run(runs: &[WorkflowRun], job_id: JobId) -> Option<&WorkflowRun> {
    let needle = job_id.to_string();
    runs.iter().find(|run| run.display_title.contains(&needle))
}

/// Run details returned by newer dispatch API versions.
#[derive(Debug, Deserialize)]
struct DispatchDetails {
    workflow_run_id: i64,
    run_url: Option<String>,
    html_url: Option<String>,
}

impl DispatchDetails {
    fn into_run(self) -> DispatchedRun {
        DispatchedRun {
            run_id: self.workflow_run_id.to_string(),
            run_url: self.html_url.or(self.run_url).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowRuns {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    id: i64,
    html_url: String,
    #[serde(default)]
    display_title: String,
}

/// GitHub API errors.
#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("no workflow run found for job {0}")]
    RunNotFound(JobId),
}

impl GitHubError {
    async fn from_response(response: reqwest::Response, action: &str) -> Self {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        GitHubError::Api {
            status,
            message: format!("Failed to {}: {}", action, text),
        }
    }
}

impl From<GitHubError> for Error {
    fn from(err: GitHubError) -> Self {
        match err {
            GitHubError::Request(_) => Error::Unavailable(err.to_string()),
            GitHubError::Api { status, .. } if status >= 500 => {
                Error::Unavailable(err.to_string())
            }
            _ => Error::Dispatch(err.to_string()),
        }
    }
}
