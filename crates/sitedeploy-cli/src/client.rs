//! HTTP client for the orchestrator API.

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sitedeploy_core::{DeploymentJob, JobId};
use tracing::debug;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid API URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Body of `POST /deployments`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_title: Option<String>,
    pub deployment_type: String,
    pub triggered_by: String,
}

/// Query for `GET /deployments`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct JobEnvelope {
    pub job: DeploymentJob,
    #[serde(default)]
    pub created: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct StatusEnvelope {
    pub job: DeploymentJob,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListEnvelope {
    pub jobs: Vec<DeploymentJob>,
    pub total: i64,
}

#[derive(Debug, Deserialize)]
pub struct ProcessEnvelope {
    pub claimed: usize,
    pub dispatched: usize,
    pub dispatch_failures: usize,
    pub timed_out: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: String,
}

/// Thin wrapper over the orchestrator's JSON API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(api_url: &str) -> ClientResult<Self> {
        let mut base = Url::parse(api_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
        })
    }

    fn url(&self, path: &str) -> ClientResult<Url> {
        Ok(self.base.join(path)?)
    }

    fn request(&self, method: Method, path: &str) -> ClientResult<RequestBuilder> {
        let url = self.url(path)?;
        debug!(%method, %url, "API request");
        Ok(self
            .http
            .request(method, url)
            .header("User-Agent", "sitedeploy-cli"))
    }

    pub async fn create(&self, request: &CreateRequest) -> ClientResult<JobEnvelope> {
        let response = self
            .request(Method::POST, "deployments")?
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn status(&self, id: JobId) -> ClientResult<StatusEnvelope> {
        let response = self
            .request(Method::GET, &format!("deployments/{}", id))?
            .send()
            .await?;
        decode(response).await
    }

    pub async fn list(&self, query: &ListQuery) -> ClientResult<ListEnvelope> {
        let response = self
            .request(Method::GET, "deployments")?
            .query(query)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn retry(&self, id: JobId) -> ClientResult<JobEnvelope> {
        let response = self
            .request(Method::POST, &format!("deployments/{}/retry", id))?
            .send()
            .await?;
        decode(response).await
    }

    pub async fn cancel(&self, id: JobId) -> ClientResult<JobEnvelope> {
        let response = self
            .request(Method::POST, &format!("deployments/{}/cancel", id))?
            .send()
            .await?;
        decode(response).await
    }

    pub async fn process(&self, cron_secret: &str) -> ClientResult<ProcessEnvelope> {
        let response = self
            .request(Method::POST, "cron/process")?
            .bearer_auth(cron_secret)
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorEnvelope>(&text)
        .map(|e| e.error)
        .unwrap_or(text);
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}
