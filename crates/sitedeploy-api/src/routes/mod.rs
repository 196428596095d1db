//! API routes.

pub mod cron;
pub mod deployments;
pub mod health;
pub mod webhooks;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/deployments", deployments::router())
        .nest("/cron", cron::router())
        .nest("/webhooks", webhooks::router())
        .merge(health::router())
        .with_state(state)
}
