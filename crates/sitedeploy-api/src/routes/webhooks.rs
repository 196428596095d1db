//! Webhook endpoints for the CMS and the CI system.

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use sitedeploy_core::{BuildOutcome, ContentRef, DeploymentType, JobId, TriggerSource};
use sitedeploy_scheduler::ReportResult;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;
use crate::routes::deployments::JobResponse;

const SIGNATURE_HEADER: &str = "X-Signature-256";
const WORDPRESS_SECRET_HEADER: &str = "X-Webhook-Secret";
const PUBLISHED: &str = "publish";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ci", post(ci_callback))
        .route("/wordpress", post(wordpress_webhook))
}

/// GitHub run ids are numeric; other CI systems use strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RunId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunId::Number(n) => write!(f, "{}", n),
            RunId::Text(s) => f.write_str(s),
        }
    }
}

/// GitHub Actions job conclusions that finish a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Conclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
}

impl Conclusion {
    fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Cancelled => "cancelled",
            Conclusion::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Deserialize)]
struct CiCallback {
    run_id: RunId,
    conclusion: Conclusion,
    build_hash: Option<String>,
    deployment_url: Option<String>,
    error: Option<String>,
}

impl CiCallback {
    fn outcome(self) -> BuildOutcome {
        match self.conclusion {
            Conclusion::Success => BuildOutcome::Success {
                build_hash: self.build_hash,
                deployment_url: self.deployment_url,
            },
            other => BuildOutcome::Failure {
                error: self
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| format!("build {}", other.as_str())),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct CallbackResponse {
    success: bool,
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<JobId>,
}

/// Handle a build completion report from CI.
///
/// Authenticated calls always succeed; reports for finished jobs or unknown
/// runs are acknowledged without changing anything.
async fn ci_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackResponse>, ApiError> {
    let secret = state
        .auth
        .callback_secret
        .as_ref()
        .ok_or_else(|| ApiError::Unauthorized("CI callbacks are disabled".into()))?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if !verify_signature(secret.expose(), &body, signature) {
        warn!("Rejected CI callback with invalid signature");
        return Err(ApiError::Unauthorized("Invalid signature".into()));
    }

    let callback: CiCallback = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;
    let run_id = callback.run_id.to_string();
    info!(
        run_id = %run_id,
        conclusion = callback.conclusion.as_str(),
        "Received CI callback"
    );

    let (result, job_id) = match state.reporter.report(&run_id, &callback.outcome()).await? {
        ReportResult::Applied(job) => ("applied", Some(job.id)),
        ReportResult::AlreadyTerminal(job) => ("ignored", Some(job.id)),
        ReportResult::UnknownRun => ("unknown_run", None),
    };

    Ok(Json(CallbackResponse {
        success: true,
        result,
        job_id,
    }))
}

#[derive(Debug, Deserialize)]
struct WordpressEvent {
    post_id: i64,
    post_slug: Option<String>,
    post_title: Option<String>,
    post_status: Option<String>,
    action: Option<String>,
}

impl WordpressEvent {
    /// Events without a status are treated as published.
    fn is_published(&self) -> bool {
        self.post_status.as_deref().is_none_or(|s| s == PUBLISHED)
    }

    fn content_ref(&self) -> ContentRef {
        ContentRef {
            post_id: self.post_id,
            post_slug: non_blank(&self.post_slug),
            post_title: non_blank(&self.post_title),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.trim().is_empty())
}

/// Handle a content change event from WordPress.
async fn wordpress_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<WordpressEvent>, JsonRejection>,
) -> Result<Response, ApiError> {
    let secret = state
        .auth
        .wordpress_secret
        .as_ref()
        .ok_or_else(|| ApiError::Unauthorized("CMS webhooks are disabled".into()))?;

    let presented = headers
        .get(WORDPRESS_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !secret.matches(presented) {
        warn!("Rejected CMS webhook with invalid secret");
        return Err(ApiError::Unauthorized("Invalid webhook secret".into()));
    }

    let Json(event) = payload?;
    info!(
        post_id = event.post_id,
        action = ?event.action,
        post_status = ?event.post_status,
        "Received CMS webhook"
    );

    if !event.is_published() {
        let body = json!({
            "success": true,
            "skipped": true,
            "reason": format!(
                "post status {} is not published",
                event.post_status.as_deref().unwrap_or_default()
            ),
        });
        return Ok(Json(body).into_response());
    }

    let metadata = json!({
        "cms_event": {
            "action": event.action,
            "post_status": event.post_status,
        }
    });
    let inserted = state
        .intake
        .create(
            TriggerSource::Wordpress,
            DeploymentType::Incremental,
            Some(event.content_ref()),
            metadata,
        )
        .await?;

    Ok(JobResponse::inserted(inserted).into_response())
}

/// Verify an HMAC-SHA256 signature of the form `sha256=<hex>`.
fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"run_id":1,"conclusion":"success"}"#;
        let signature = sign("s3cret", body);
        assert!(verify_signature("s3cret", body, Some(&signature)));
        assert!(!verify_signature("other", body, Some(&signature)));
        assert!(!verify_signature("s3cret", b"tampered", Some(&signature)));
        assert!(!verify_signature("s3cret", body, Some("sha256=zz")));
        assert!(!verify_signature("s3cret", body, Some(signature.trim_start_matches("sha256="))));
        assert!(!verify_signature("s3cret", body, None));
    }

    #[test]
    fn test_failure_without_message_gets_default_error() {
        let callback: CiCallback = serde_json::from_value(json!({
            "run_id": "r-1",
            "conclusion": "timed_out",
        }))
        .unwrap();
        assert_eq!(
            callback.outcome(),
            BuildOutcome::Failure {
                error: "build timed_out".to_string()
            }
        );
    }

    #[test]
    fn test_numeric_run_id() {
        let callback: CiCallback = serde_json::from_value(json!({
            "run_id": 123456789,
            "conclusion": "success",
            "build_hash": "abc123",
        }))
        .unwrap();
        assert_eq!(callback.run_id.to_string(), "123456789");
    }

    #[test]
    fn test_missing_status_counts_as_published() {
        let event: WordpressEvent = serde_json::from_value(json!({ "post_id": 9 })).unwrap();
        assert!(event.is_published());

        let draft: WordpressEvent =
            serde_json::from_value(json!({ "post_id": 9, "post_status": "draft" })).unwrap();
        assert!(!draft.is_published());
    }
}
