//! CLI command implementations.

pub mod watch;

use anyhow::{Result, bail};
use chrono::Utc;
use sitedeploy_core::{DeploymentJob, JobId};

use crate::client::{ApiClient, CreateRequest, ListQuery};

pub async fn create(client: &ApiClient, request: CreateRequest) -> Result<()> {
    let envelope = client.create(&request).await?;
    if envelope.created == Some(false) {
        println!("Post already has an active deployment; reusing it");
    } else {
        println!("Created deployment");
    }
    println!("{}", describe(&envelope.job));
    Ok(())
}

pub async fn status(client: &ApiClient, id: JobId) -> Result<()> {
    let envelope = client.status(id).await?;
    println!("{}", describe(&envelope.job));
    if let Some(seconds) = envelope.duration_seconds {
        println!("  duration:  {}s", seconds);
    }
    Ok(())
}

pub async fn list(client: &ApiClient, query: ListQuery) -> Result<()> {
    let page = client.list(&query).await?;
    if page.jobs.is_empty() {
        println!("No deployments found");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<11}  {:<9}  {:>8}  CREATED",
        "ID", "STATUS", "TYPE", "SOURCE", "POST"
    );
    for job in &page.jobs {
        println!("{}", summary_row(job));
    }
    println!("Showing {} of {}", page.jobs.len(), page.total);
    Ok(())
}

pub async fn retry(client: &ApiClient, id: JobId) -> Result<()> {
    let envelope = client.retry(id).await?;
    println!("Retrying {} as {}", id, envelope.job.id);
    println!("{}", describe(&envelope.job));
    Ok(())
}

pub async fn cancel(client: &ApiClient, id: JobId) -> Result<()> {
    let envelope = client.cancel(id).await?;
    println!("Cancelled {}", envelope.job.id);
    Ok(())
}

pub async fn process(client: &ApiClient, cron_secret: Option<String>) -> Result<()> {
    let Some(secret) = cron_secret else {
        bail!("a cron secret is required (--cron-secret or CRON_SECRET)");
    };
    let report = client.process(&secret).await?;
    println!(
        "claimed {}, dispatched {}, dispatch failures {}, timed out {}",
        report.claimed, report.dispatched, report.dispatch_failures, report.timed_out
    );
    Ok(())
}

/// Multi-line description of a job.
pub fn describe(job: &DeploymentJob) -> String {
    let mut lines = vec![
        format!("{}  {}", job.id, job.status),
        format!("  type:      {} ({})", job.deployment_type, job.triggered_by),
    ];
    if let Some(post_id) = job.post_id {
        let label = job
            .post_title
            .as_deref()
            .or(job.post_slug.as_deref())
            .unwrap_or("untitled");
        lines.push(format!("  post:      {} {}", post_id, label));
    }
    lines.push(format!("  created:   {}", job.created_at.to_rfc3339()));
    if let Some(url) = &job.github_run_url {
        lines.push(format!("  run:       {}", url));
    }
    if let Some(url) = &job.deployment_url {
        lines.push(format!("  deployed:  {}", url));
    }
    if let Some(hash) = &job.build_hash {
        lines.push(format!("  build:     {}", hash));
    }
    if let Some(error) = &job.error_message {
        lines.push(format!("  error:     {}", error));
    }
    lines.join("\n")
}

fn summary_row(job: &DeploymentJob) -> String {
    let post = job.post_id.map(|id| id.to_string()).unwrap_or_default();
    let age = Utc::now() - job.created_at;
    format!(
        "{:<36}  {:<10}  {:<11}  {:<9}  {:>8}  {}m ago",
        job.id.to_string(),
        job.status.as_str(),
        job.deployment_type.as_str(),
        job.triggered_by.as_str(),
        post,
        age.num_minutes()
    )
}
