//! Shared-secret authentication for privileged endpoints.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::AppState;
use crate::error::ApiError;

/// Caller presented the cron bearer credential.
///
/// When no cron secret is configured every request is rejected.
#[derive(Debug, Clone, Copy)]
pub struct CronAuth;

impl FromRequestParts<AppState> for CronAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let secret = state
            .auth
            .cron_secret
            .as_ref()
            .ok_or_else(|| ApiError::Unauthorized("Scheduled processing is disabled".into()))?;

        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".into()))?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            ApiError::Unauthorized("Invalid Authorization format. Expected: Bearer <token>".into())
        })?;

        if !secret.matches(token) {
            return Err(ApiError::Unauthorized("Invalid credentials".into()));
        }
        Ok(CronAuth)
    }
}
