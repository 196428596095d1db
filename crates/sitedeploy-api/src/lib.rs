//! HTTP API server for the sitedeploy orchestrator.
//!
//! Exposes job creation, status and history endpoints, the scheduled
//! processing trigger, and webhooks for the CMS and CI.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
